//! Wallet and session repositories.
//!
//! The control plane never creates wallets in production; `create` exists for
//! seeding and tests. Suspension and revocation are conditional so that
//! concurrent triggers collapse into one state change.

use super::DbError;
use crate::wallet::{Session, Wallet};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Repository trait for wallet persistence.
#[async_trait]
pub trait WalletRepository: Send + Sync {
    /// Creates a wallet.
    async fn create(&self, wallet: &Wallet) -> Result<Wallet, DbError>;

    /// Gets a wallet by ID.
    async fn get(&self, id: Uuid) -> Result<Option<Wallet>, DbError>;

    /// Moves an ACTIVE wallet to SUSPENDED.
    ///
    /// Returns false if the wallet is missing or not ACTIVE.
    async fn suspend_if_active(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool, DbError>;

    /// Moves a SUSPENDED wallet back to ACTIVE and clears the suspension.
    async fn reactivate(&self, id: Uuid) -> Result<bool, DbError>;

    /// Suspends every ACTIVE wallet. Returns the number suspended.
    async fn suspend_all_active(&self, at: DateTime<Utc>, reason: &str) -> Result<u64, DbError>;
}

/// Repository trait for session persistence.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Creates a session.
    async fn create(&self, session: &Session) -> Result<Session, DbError>;

    /// Gets a session by ID.
    async fn get(&self, id: Uuid) -> Result<Option<Session>, DbError>;

    /// Lists sessions that are neither revoked nor expired at `now`.
    async fn list_live(&self, now: DateTime<Utc>) -> Result<Vec<Session>, DbError>;

    /// Revokes a session if it has not been revoked yet.
    async fn revoke_if_live(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, DbError>;

    /// Revokes every session not revoked yet. Returns the number revoked.
    async fn revoke_all(&self, at: DateTime<Utc>) -> Result<u64, DbError>;
}

/// SQLite implementation of WalletRepository.
#[cfg(feature = "database")]
pub struct SqliteWalletRepository {
    pool: sqlx::SqlitePool,
}

#[cfg(feature = "database")]
impl SqliteWalletRepository {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl WalletRepository for SqliteWalletRepository {
    async fn create(&self, wallet: &Wallet) -> Result<Wallet, DbError> {
        use super::codec::timestamp_to_db;

        sqlx::query(
            r#"
            INSERT INTO wallets (id, chain, network, environment, status, suspended_at, suspension_reason)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(wallet.id.to_string())
        .bind(&wallet.chain)
        .bind(&wallet.network)
        .bind(&wallet.environment)
        .bind(wallet.status.as_db_str())
        .bind(wallet.suspended_at.as_ref().map(timestamp_to_db))
        .bind(&wallet.suspension_reason)
        .execute(&self.pool)
        .await?;

        Ok(wallet.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Wallet>, DbError> {
        let row: Option<WalletRow> = sqlx::query_as(
            r#"
            SELECT id, chain, network, environment, status, suspended_at, suspension_reason
            FROM wallets WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Wallet::try_from).transpose()
    }

    async fn suspend_if_active(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE wallets
            SET status = 'SUSPENDED', suspended_at = ?, suspension_reason = ?
            WHERE id = ? AND status = 'ACTIVE'
            "#,
        )
        .bind(super::codec::timestamp_to_db(&at))
        .bind(reason)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn reactivate(&self, id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE wallets
            SET status = 'ACTIVE', suspended_at = NULL, suspension_reason = NULL
            WHERE id = ? AND status = 'SUSPENDED'
            "#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn suspend_all_active(&self, at: DateTime<Utc>, reason: &str) -> Result<u64, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE wallets
            SET status = 'SUSPENDED', suspended_at = ?, suspension_reason = ?
            WHERE status = 'ACTIVE'
            "#,
        )
        .bind(super::codec::timestamp_to_db(&at))
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// SQLite implementation of SessionRepository.
#[cfg(feature = "database")]
pub struct SqliteSessionRepository {
    pool: sqlx::SqlitePool,
}

#[cfg(feature = "database")]
impl SqliteSessionRepository {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl SessionRepository for SqliteSessionRepository {
    async fn create(&self, session: &Session) -> Result<Session, DbError> {
        sqlx::query(
            "INSERT INTO sessions (id, wallet_id, expires_at, revoked_at) VALUES (?, ?, ?, ?)",
        )
        .bind(session.id.to_string())
        .bind(session.wallet_id.to_string())
        .bind(session.expires_at.timestamp())
        .bind(session.revoked_at.as_ref().map(super::codec::timestamp_to_db))
        .execute(&self.pool)
        .await?;

        Ok(session.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Session>, DbError> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT id, wallet_id, expires_at, revoked_at FROM sessions WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Session::try_from).transpose()
    }

    async fn list_live(&self, now: DateTime<Utc>) -> Result<Vec<Session>, DbError> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, wallet_id, expires_at, revoked_at FROM sessions
            WHERE revoked_at IS NULL AND expires_at > ?
            "#,
        )
        .bind(now.timestamp())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Session::try_from).collect()
    }

    async fn revoke_if_live(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, DbError> {
        let result =
            sqlx::query("UPDATE sessions SET revoked_at = ? WHERE id = ? AND revoked_at IS NULL")
                .bind(super::codec::timestamp_to_db(&at))
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn revoke_all(&self, at: DateTime<Utc>) -> Result<u64, DbError> {
        let result = sqlx::query("UPDATE sessions SET revoked_at = ? WHERE revoked_at IS NULL")
            .bind(super::codec::timestamp_to_db(&at))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(feature = "database")]
#[derive(sqlx::FromRow)]
struct WalletRow {
    id: String,
    chain: String,
    network: String,
    environment: String,
    status: String,
    suspended_at: Option<String>,
    suspension_reason: Option<String>,
}

#[cfg(feature = "database")]
impl TryFrom<WalletRow> for Wallet {
    type Error = DbError;

    fn try_from(row: WalletRow) -> Result<Self, Self::Error> {
        use super::codec::{parse_uuid, timestamp_from_db};
        use crate::wallet::WalletStatus;

        Ok(Wallet {
            id: parse_uuid(&row.id)?,
            chain: row.chain,
            network: row.network,
            environment: row.environment,
            status: WalletStatus::from_db_str(&row.status).ok_or_else(|| {
                DbError::Serialization(format!("unknown wallet status '{}'", row.status))
            })?,
            suspended_at: row.suspended_at.as_deref().map(timestamp_from_db).transpose()?,
            suspension_reason: row.suspension_reason,
        })
    }
}

#[cfg(feature = "database")]
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    wallet_id: String,
    expires_at: i64,
    revoked_at: Option<String>,
}

#[cfg(feature = "database")]
impl TryFrom<SessionRow> for Session {
    type Error = DbError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        use super::codec::{epoch_from_db, parse_uuid, timestamp_from_db};

        Ok(Session {
            id: parse_uuid(&row.id)?,
            wallet_id: parse_uuid(&row.wallet_id)?,
            expires_at: epoch_from_db(row.expires_at)?,
            revoked_at: row.revoked_at.as_deref().map(timestamp_from_db).transpose()?,
        })
    }
}
