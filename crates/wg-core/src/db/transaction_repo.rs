//! Transaction repository.
//!
//! Every status change goes through [`TransactionRepository::update_if_status`],
//! a conditional write that only touches the row when it is still in one of
//! the expected statuses. Callers that lose a race get `false` back and treat
//! it as a no-op.

use super::DbError;
use crate::amount::Amount;
use crate::transaction::{Transaction, TransactionStatus, TransactionUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Repository trait for transaction persistence.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Creates a new transaction.
    async fn create(&self, tx: &Transaction) -> Result<Transaction, DbError>;

    /// Gets a transaction by ID.
    async fn get(&self, id: Uuid) -> Result<Option<Transaction>, DbError>;

    /// Applies `update` if the row's status is one of `expected`.
    ///
    /// Returns whether a row was changed.
    async fn update_if_status(
        &self,
        id: Uuid,
        expected: &[TransactionStatus],
        update: &TransactionUpdate,
    ) -> Result<bool, DbError>;

    /// Lists QUEUED transactions whose `delay_until` is at or before `now`.
    async fn list_due_delays(&self, now: DateTime<Utc>) -> Result<Vec<Transaction>, DbError>;

    /// Lists transactions in any of `statuses`, oldest first.
    async fn list_by_status(
        &self,
        statuses: &[TransactionStatus],
    ) -> Result<Vec<Transaction>, DbError>;

    /// Lists a wallet's transactions, oldest first.
    async fn list_for_wallet(&self, wallet_id: Uuid) -> Result<Vec<Transaction>, DbError>;

    /// Sums reservations held by the wallet's PENDING, QUEUED and
    /// PENDING_APPROVAL transactions.
    async fn reserved_total(&self, wallet_id: Uuid) -> Result<Amount, DbError>;
}

/// SQLite implementation of TransactionRepository.
#[cfg(feature = "database")]
pub struct SqliteTransactionRepository {
    pool: sqlx::SqlitePool,
}

#[cfg(feature = "database")]
impl SqliteTransactionRepository {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "database")]
const TRANSACTION_COLUMNS: &str = "id, wallet_id, type, status, tier, amount, to_address, network, reserved_amount, queued_at, delay_until, error, created_at";

#[cfg(feature = "database")]
#[async_trait]
impl TransactionRepository for SqliteTransactionRepository {
    async fn create(&self, tx: &Transaction) -> Result<Transaction, DbError> {
        use super::codec::timestamp_to_db;

        sqlx::query(
            r#"
            INSERT INTO transactions (id, wallet_id, type, status, tier, amount, to_address, network, reserved_amount, queued_at, delay_until, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(tx.id.to_string())
        .bind(tx.wallet_id.to_string())
        .bind(tx.tx_type.as_db_str())
        .bind(tx.status.as_db_str())
        .bind(tx.tier.map(|t| t.as_db_str()))
        .bind(tx.amount.to_string())
        .bind(&tx.to_address)
        .bind(&tx.network)
        .bind(tx.reserved_amount.as_ref().map(|a| a.to_string()))
        .bind(tx.queued_at.as_ref().map(timestamp_to_db))
        .bind(tx.delay_until.map(|at| at.timestamp()))
        .bind(&tx.error)
        .bind(timestamp_to_db(&tx.created_at))
        .execute(&self.pool)
        .await?;

        Ok(tx.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Transaction>, DbError> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM transactions WHERE id = ?",
            TRANSACTION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Transaction::try_from).transpose()
    }

    async fn update_if_status(
        &self,
        id: Uuid,
        expected: &[TransactionStatus],
        update: &TransactionUpdate,
    ) -> Result<bool, DbError> {
        use super::codec::timestamp_to_db;
        use sqlx::{QueryBuilder, Sqlite};

        if expected.is_empty() {
            return Ok(false);
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE transactions SET ");
        let mut fields = builder.separated(", ");
        // Keeps the statement valid when the patch is empty.
        fields.push("id = id");
        if let Some(status) = update.status {
            fields.push("status = ").push_bind_unseparated(status.as_db_str());
        }
        if let Some(tier) = update.tier {
            fields.push("tier = ").push_bind_unseparated(tier.as_db_str());
        }
        if let Some(reserved) = &update.reserved_amount {
            fields
                .push("reserved_amount = ")
                .push_bind_unseparated(reserved.as_ref().map(|a| a.to_string()));
        }
        if let Some(queued_at) = &update.queued_at {
            fields
                .push("queued_at = ")
                .push_bind_unseparated(queued_at.as_ref().map(timestamp_to_db));
        }
        if let Some(delay_until) = &update.delay_until {
            fields
                .push("delay_until = ")
                .push_bind_unseparated(delay_until.map(|at| at.timestamp()));
        }
        if let Some(error) = &update.error {
            fields.push("error = ").push_bind_unseparated(error.clone());
        }

        builder.push(" WHERE id = ").push_bind(id.to_string());
        builder.push(" AND status IN (");
        let mut statuses = builder.separated(", ");
        for status in expected {
            statuses.push_bind(status.as_db_str());
        }
        statuses.push_unseparated(")");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_due_delays(&self, now: DateTime<Utc>) -> Result<Vec<Transaction>, DbError> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM transactions
            WHERE status = 'QUEUED' AND delay_until IS NOT NULL AND delay_until <= ?
            ORDER BY delay_until ASC
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(now.timestamp())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Transaction::try_from).collect()
    }

    async fn list_by_status(
        &self,
        statuses: &[TransactionStatus],
    ) -> Result<Vec<Transaction>, DbError> {
        use sqlx::{QueryBuilder, Sqlite};

        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM transactions WHERE status IN (",
            TRANSACTION_COLUMNS
        ));
        let mut bound = builder.separated(", ");
        for status in statuses {
            bound.push_bind(status.as_db_str());
        }
        bound.push_unseparated(") ORDER BY created_at ASC");

        let rows: Vec<TransactionRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(Transaction::try_from).collect()
    }

    async fn list_for_wallet(&self, wallet_id: Uuid) -> Result<Vec<Transaction>, DbError> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM transactions WHERE wallet_id = ? ORDER BY created_at ASC",
            TRANSACTION_COLUMNS
        ))
        .bind(wallet_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Transaction::try_from).collect()
    }

    async fn reserved_total(&self, wallet_id: Uuid) -> Result<Amount, DbError> {
        // Summed in Rust: SQLite integers are 64-bit.
        let reserved: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT reserved_amount FROM transactions
            WHERE wallet_id = ?
              AND status IN ('PENDING', 'QUEUED', 'PENDING_APPROVAL')
              AND reserved_amount IS NOT NULL
            "#,
        )
        .bind(wallet_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        reserved
            .iter()
            .map(|(amount,)| super::codec::amount_from_db(amount))
            .sum()
    }
}

#[cfg(feature = "database")]
#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: String,
    wallet_id: String,
    #[sqlx(rename = "type")]
    tx_type: String,
    status: String,
    tier: Option<String>,
    amount: String,
    to_address: String,
    network: Option<String>,
    reserved_amount: Option<String>,
    queued_at: Option<String>,
    delay_until: Option<i64>,
    error: Option<String>,
    created_at: String,
}

#[cfg(feature = "database")]
impl TryFrom<TransactionRow> for Transaction {
    type Error = DbError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        use super::codec::{amount_from_db, epoch_from_db, parse_uuid, timestamp_from_db};
        use crate::policy::Tier;
        use crate::transaction::TransactionType;

        Ok(Transaction {
            id: parse_uuid(&row.id)?,
            wallet_id: parse_uuid(&row.wallet_id)?,
            tx_type: TransactionType::from_db_str(&row.tx_type).ok_or_else(|| {
                DbError::Serialization(format!("unknown transaction type '{}'", row.tx_type))
            })?,
            status: TransactionStatus::from_db_str(&row.status).ok_or_else(|| {
                DbError::Serialization(format!("unknown transaction status '{}'", row.status))
            })?,
            tier: row
                .tier
                .as_deref()
                .map(|t| {
                    Tier::from_db_str(t)
                        .ok_or_else(|| DbError::Serialization(format!("unknown tier '{}'", t)))
                })
                .transpose()?,
            amount: amount_from_db(&row.amount)?,
            to_address: row.to_address,
            network: row.network,
            reserved_amount: row.reserved_amount.as_deref().map(amount_from_db).transpose()?,
            queued_at: row.queued_at.as_deref().map(timestamp_from_db).transpose()?,
            delay_until: row.delay_until.map(epoch_from_db).transpose()?,
            error: row.error,
            created_at: timestamp_from_db(&row.created_at)?,
        })
    }
}
