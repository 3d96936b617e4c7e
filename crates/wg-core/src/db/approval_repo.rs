//! Pending approval repository.

use super::DbError;
use crate::transaction::{ApprovalResolution, PendingApproval};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Repository trait for pending approval persistence.
#[async_trait]
pub trait ApprovalRepository: Send + Sync {
    /// Creates a pending approval.
    ///
    /// Fails with [`DbError::Constraint`] if the transaction already has an
    /// unresolved approval.
    async fn create(&self, approval: &PendingApproval) -> Result<PendingApproval, DbError>;

    /// Gets the most recent approval for a transaction.
    async fn get_by_tx(&self, tx_id: Uuid) -> Result<Option<PendingApproval>, DbError>;

    /// Records a resolution if the approval is still unresolved.
    ///
    /// Returns whether the row was changed. A second resolver always gets
    /// `false`.
    async fn resolve(
        &self,
        id: Uuid,
        resolution: ApprovalResolution,
        at: DateTime<Utc>,
        channel: Option<&str>,
    ) -> Result<bool, DbError>;

    /// Lists unresolved approvals, oldest first.
    async fn list_unresolved(&self) -> Result<Vec<PendingApproval>, DbError>;

    /// Lists unresolved approvals whose `expires_at` is at or before `now`.
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<PendingApproval>, DbError>;
}

/// SQLite implementation of ApprovalRepository.
#[cfg(feature = "database")]
pub struct SqliteApprovalRepository {
    pool: sqlx::SqlitePool,
}

#[cfg(feature = "database")]
impl SqliteApprovalRepository {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "database")]
const APPROVAL_COLUMNS: &str =
    "id, tx_id, created_at, expires_at, approved_at, rejected_at, expired_at, approval_channel";

#[cfg(feature = "database")]
const UNRESOLVED: &str = "approved_at IS NULL AND rejected_at IS NULL AND expired_at IS NULL";

#[cfg(feature = "database")]
#[async_trait]
impl ApprovalRepository for SqliteApprovalRepository {
    async fn create(&self, approval: &PendingApproval) -> Result<PendingApproval, DbError> {
        use super::codec::timestamp_to_db;

        // The partial unique index on tx_id enforces one unresolved row.
        sqlx::query(
            r#"
            INSERT INTO pending_approvals (id, tx_id, created_at, expires_at, approved_at, rejected_at, expired_at, approval_channel)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(approval.id.to_string())
        .bind(approval.tx_id.to_string())
        .bind(timestamp_to_db(&approval.created_at))
        .bind(approval.expires_at.timestamp())
        .bind(approval.approved_at.as_ref().map(timestamp_to_db))
        .bind(approval.rejected_at.as_ref().map(timestamp_to_db))
        .bind(approval.expired_at.as_ref().map(timestamp_to_db))
        .bind(&approval.approval_channel)
        .execute(&self.pool)
        .await?;

        Ok(approval.clone())
    }

    async fn get_by_tx(&self, tx_id: Uuid) -> Result<Option<PendingApproval>, DbError> {
        let row: Option<ApprovalRow> = sqlx::query_as(&format!(
            "SELECT {} FROM pending_approvals WHERE tx_id = ? ORDER BY created_at DESC LIMIT 1",
            APPROVAL_COLUMNS
        ))
        .bind(tx_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(PendingApproval::try_from).transpose()
    }

    async fn resolve(
        &self,
        id: Uuid,
        resolution: ApprovalResolution,
        at: DateTime<Utc>,
        channel: Option<&str>,
    ) -> Result<bool, DbError> {
        let column = match resolution {
            ApprovalResolution::Approved => "approved_at",
            ApprovalResolution::Rejected => "rejected_at",
            ApprovalResolution::Expired => "expired_at",
        };

        let result = sqlx::query(&format!(
            r#"
            UPDATE pending_approvals
            SET {} = ?, approval_channel = COALESCE(?, approval_channel)
            WHERE id = ? AND {}
            "#,
            column, UNRESOLVED
        ))
        .bind(super::codec::timestamp_to_db(&at))
        .bind(channel)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_unresolved(&self) -> Result<Vec<PendingApproval>, DbError> {
        let rows: Vec<ApprovalRow> = sqlx::query_as(&format!(
            "SELECT {} FROM pending_approvals WHERE {} ORDER BY created_at ASC",
            APPROVAL_COLUMNS, UNRESOLVED
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PendingApproval::try_from).collect()
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<PendingApproval>, DbError> {
        let rows: Vec<ApprovalRow> = sqlx::query_as(&format!(
            "SELECT {} FROM pending_approvals WHERE {} AND expires_at <= ? ORDER BY expires_at ASC",
            APPROVAL_COLUMNS, UNRESOLVED
        ))
        .bind(now.timestamp())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PendingApproval::try_from).collect()
    }
}

#[cfg(feature = "database")]
#[derive(sqlx::FromRow)]
struct ApprovalRow {
    id: String,
    tx_id: String,
    created_at: String,
    expires_at: i64,
    approved_at: Option<String>,
    rejected_at: Option<String>,
    expired_at: Option<String>,
    approval_channel: Option<String>,
}

#[cfg(feature = "database")]
impl TryFrom<ApprovalRow> for PendingApproval {
    type Error = DbError;

    fn try_from(row: ApprovalRow) -> Result<Self, Self::Error> {
        use super::codec::{epoch_from_db, parse_uuid, timestamp_from_db};

        Ok(PendingApproval {
            id: parse_uuid(&row.id)?,
            tx_id: parse_uuid(&row.tx_id)?,
            created_at: timestamp_from_db(&row.created_at)?,
            expires_at: epoch_from_db(row.expires_at)?,
            approved_at: row.approved_at.as_deref().map(timestamp_from_db).transpose()?,
            rejected_at: row.rejected_at.as_deref().map(timestamp_from_db).transpose()?,
            expired_at: row.expired_at.as_deref().map(timestamp_from_db).transpose()?,
            approval_channel: row.approval_channel,
        })
    }
}
