//! Policy repository.

use super::DbError;
use crate::policy::{Policy, PolicyRules, PolicyType};
use async_trait::async_trait;
use uuid::Uuid;

/// Partial update for a policy.
#[derive(Debug, Clone, Default)]
pub struct PolicyUpdate {
    pub rules: Option<PolicyRules>,
    pub network: Option<Option<String>>,
    pub priority: Option<i32>,
    pub enabled: Option<bool>,
}

/// Repository trait for policy persistence.
///
/// Policies are written by the administrative surface; the engine only calls
/// [`PolicyRepository::list_candidates`].
#[async_trait]
pub trait PolicyRepository: Send + Sync {
    /// Creates a new policy.
    async fn create(&self, policy: &Policy) -> Result<Policy, DbError>;

    /// Gets a policy by ID.
    async fn get(&self, id: Uuid) -> Result<Option<Policy>, DbError>;

    /// Lists all policies, highest priority first.
    async fn list(&self) -> Result<Vec<Policy>, DbError>;

    /// Updates a policy.
    async fn update(&self, id: Uuid, update: &PolicyUpdate) -> Result<Policy, DbError>;

    /// Deletes a policy.
    async fn delete(&self, id: Uuid) -> Result<bool, DbError>;

    /// Lists enabled policies of `policy_type` that are global or scoped to
    /// `wallet_id`, and that are network-agnostic or scoped to `network`.
    ///
    /// When `network` is `None` only network-agnostic policies qualify.
    async fn list_candidates(
        &self,
        policy_type: PolicyType,
        wallet_id: Uuid,
        network: Option<&str>,
    ) -> Result<Vec<Policy>, DbError>;
}

/// SQLite implementation of PolicyRepository.
#[cfg(feature = "database")]
pub struct SqlitePolicyRepository {
    pool: sqlx::SqlitePool,
}

#[cfg(feature = "database")]
impl SqlitePolicyRepository {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "database")]
const POLICY_COLUMNS: &str =
    "id, wallet_id, network, type, rules, priority, enabled, created_at, updated_at";

#[cfg(feature = "database")]
#[async_trait]
impl PolicyRepository for SqlitePolicyRepository {
    async fn create(&self, policy: &Policy) -> Result<Policy, DbError> {
        let rules = rules_to_db(&policy.rules)?;

        sqlx::query(
            r#"
            INSERT INTO policies (id, wallet_id, network, type, rules, priority, enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(policy.id.to_string())
        .bind(policy.wallet_id.map(|id| id.to_string()))
        .bind(&policy.network)
        .bind(policy.policy_type().as_db_str())
        .bind(&rules)
        .bind(policy.priority)
        .bind(policy.enabled)
        .bind(super::codec::timestamp_to_db(&policy.created_at))
        .bind(super::codec::timestamp_to_db(&policy.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(policy.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Policy>, DbError> {
        let row: Option<PolicyRow> =
            sqlx::query_as(&format!("SELECT {} FROM policies WHERE id = ?", POLICY_COLUMNS))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        row.map(Policy::try_from).transpose()
    }

    async fn list(&self) -> Result<Vec<Policy>, DbError> {
        let rows: Vec<PolicyRow> = sqlx::query_as(&format!(
            "SELECT {} FROM policies ORDER BY priority DESC, created_at DESC",
            POLICY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Policy::try_from).collect()
    }

    async fn update(&self, id: Uuid, update: &PolicyUpdate) -> Result<Policy, DbError> {
        let mut policy = self
            .get(id)
            .await?
            .ok_or_else(|| DbError::not_found("Policy", id))?;

        if let Some(rules) = &update.rules {
            policy.rules = rules.clone();
        }
        if let Some(network) = &update.network {
            policy.network = network.clone();
        }
        if let Some(priority) = update.priority {
            policy.priority = priority;
        }
        if let Some(enabled) = update.enabled {
            policy.enabled = enabled;
        }
        policy.updated_at = chrono::Utc::now();

        sqlx::query(
            r#"
            UPDATE policies
            SET network = ?, type = ?, rules = ?, priority = ?, enabled = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&policy.network)
        .bind(policy.policy_type().as_db_str())
        .bind(rules_to_db(&policy.rules)?)
        .bind(policy.priority)
        .bind(policy.enabled)
        .bind(super::codec::timestamp_to_db(&policy.updated_at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(policy)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM policies WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_candidates(
        &self,
        policy_type: PolicyType,
        wallet_id: Uuid,
        network: Option<&str>,
    ) -> Result<Vec<Policy>, DbError> {
        let rows: Vec<PolicyRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM policies
            WHERE type = ?
              AND enabled = 1
              AND (wallet_id IS NULL OR wallet_id = ?)
              AND (network IS NULL OR network = ?)
            ORDER BY priority DESC, created_at DESC
            "#,
            POLICY_COLUMNS
        ))
        .bind(policy_type.as_db_str())
        .bind(wallet_id.to_string())
        .bind(network)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Policy::try_from).collect()
    }
}

/// Stores only the inner rule object; the tag lives in the `type` column.
#[cfg(feature = "database")]
fn rules_to_db(rules: &PolicyRules) -> Result<String, DbError> {
    let tagged = serde_json::to_value(rules)?;
    let inner = tagged
        .get("rules")
        .cloned()
        .unwrap_or(serde_json::Value::Object(Default::default()));
    Ok(inner.to_string())
}

#[cfg(feature = "database")]
fn rules_from_db(policy_type: &str, rules: &str) -> Result<PolicyRules, DbError> {
    let inner: serde_json::Value = serde_json::from_str(rules)?;
    let tagged = serde_json::json!({ "type": policy_type, "rules": inner });
    Ok(serde_json::from_value(tagged)?)
}

#[cfg(feature = "database")]
#[derive(sqlx::FromRow)]
struct PolicyRow {
    id: String,
    wallet_id: Option<String>,
    network: Option<String>,
    #[sqlx(rename = "type")]
    policy_type: String,
    rules: String,
    priority: i32,
    enabled: bool,
    created_at: String,
    updated_at: String,
}

#[cfg(feature = "database")]
impl TryFrom<PolicyRow> for Policy {
    type Error = DbError;

    fn try_from(row: PolicyRow) -> Result<Self, Self::Error> {
        use super::codec::{parse_uuid, timestamp_from_db};

        Ok(Policy {
            id: parse_uuid(&row.id)?,
            wallet_id: row.wallet_id.as_deref().map(parse_uuid).transpose()?,
            network: row.network,
            rules: rules_from_db(&row.policy_type, &row.rules)?,
            priority: row.priority,
            enabled: row.enabled,
            created_at: timestamp_from_db(&row.created_at)?,
            updated_at: timestamp_from_db(&row.updated_at)?,
        })
    }
}
