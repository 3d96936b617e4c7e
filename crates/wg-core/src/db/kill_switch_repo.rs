//! Kill switch state repository.
//!
//! The state is a single row. Writers must name the state they expect to
//! replace, which makes every transition a compare-and-swap.

use super::DbError;
use crate::kill_switch::{KillSwitchRecord, KillSwitchState};
use async_trait::async_trait;

/// Repository trait for the singleton kill switch record.
#[async_trait]
pub trait KillSwitchRepository: Send + Sync {
    /// Loads the current record, or an ACTIVE record if none was written.
    async fn load(&self) -> Result<KillSwitchRecord, DbError>;

    /// Replaces the record if its current state equals `expected`.
    ///
    /// Returns whether the write happened.
    async fn compare_and_set(
        &self,
        expected: KillSwitchState,
        record: &KillSwitchRecord,
    ) -> Result<bool, DbError>;
}

/// SQLite implementation of KillSwitchRepository.
#[cfg(feature = "database")]
pub struct SqliteKillSwitchRepository {
    pool: sqlx::SqlitePool,
}

#[cfg(feature = "database")]
impl SqliteKillSwitchRepository {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl KillSwitchRepository for SqliteKillSwitchRepository {
    async fn load(&self) -> Result<KillSwitchRecord, DbError> {
        let row: Option<KillSwitchRow> = sqlx::query_as(
            r#"
            SELECT state, activated_at, activated_by, transitioned_at, failed_recovery_attempts
            FROM kill_switch WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => KillSwitchRecord::try_from(row),
            None => Ok(KillSwitchRecord::active()),
        }
    }

    async fn compare_and_set(
        &self,
        expected: KillSwitchState,
        record: &KillSwitchRecord,
    ) -> Result<bool, DbError> {
        use super::codec::timestamp_to_db;

        // The migration seeds the row, so the update path is the only one.
        let result = sqlx::query(
            r#"
            UPDATE kill_switch
            SET state = ?, activated_at = ?, activated_by = ?, transitioned_at = ?, failed_recovery_attempts = ?
            WHERE id = 1 AND state = ?
            "#,
        )
        .bind(record.state.as_db_str())
        .bind(record.activated_at.as_ref().map(timestamp_to_db))
        .bind(&record.activated_by)
        .bind(record.transitioned_at.as_ref().map(timestamp_to_db))
        .bind(i64::from(record.failed_recovery_attempts))
        .bind(expected.as_db_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(feature = "database")]
#[derive(sqlx::FromRow)]
struct KillSwitchRow {
    state: String,
    activated_at: Option<String>,
    activated_by: Option<String>,
    transitioned_at: Option<String>,
    failed_recovery_attempts: i64,
}

#[cfg(feature = "database")]
impl TryFrom<KillSwitchRow> for KillSwitchRecord {
    type Error = DbError;

    fn try_from(row: KillSwitchRow) -> Result<Self, Self::Error> {
        use super::codec::timestamp_from_db;

        Ok(KillSwitchRecord {
            state: KillSwitchState::from_db_str(&row.state).ok_or_else(|| {
                DbError::Serialization(format!("unknown kill switch state '{}'", row.state))
            })?,
            activated_at: row.activated_at.as_deref().map(timestamp_from_db).transpose()?,
            activated_by: row.activated_by,
            transitioned_at: row.transitioned_at.as_deref().map(timestamp_from_db).transpose()?,
            failed_recovery_attempts: u32::try_from(row.failed_recovery_attempts).map_err(|_| {
                DbError::Serialization(format!(
                    "invalid failed_recovery_attempts {}",
                    row.failed_recovery_attempts
                ))
            })?,
        })
    }
}
