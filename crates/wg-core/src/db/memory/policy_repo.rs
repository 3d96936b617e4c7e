//! In-memory PolicyRepository.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::{DbError, PolicyRepository, PolicyUpdate};
use crate::policy::{Policy, PolicyType};

/// PolicyRepository backed by a HashMap.
#[derive(Clone)]
pub struct InMemoryPolicyRepository {
    policies: Arc<RwLock<HashMap<Uuid, Policy>>>,
}

impl Default for InMemoryPolicyRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPolicyRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self {
            policies: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Creates a repository pre-populated with policies.
    pub fn with_policies(policies: Vec<Policy>) -> Self {
        let map: HashMap<Uuid, Policy> = policies.into_iter().map(|p| (p.id, p)).collect();
        Self {
            policies: Arc::new(RwLock::new(map)),
        }
    }

    /// Gets a snapshot of all stored policies.
    pub async fn snapshot(&self) -> Vec<Policy> {
        self.policies.read().await.values().cloned().collect()
    }

    /// Removes all policies.
    pub async fn clear(&self) {
        self.policies.write().await.clear();
    }
}

fn sort_by_precedence(policies: &mut [Policy]) {
    policies.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
}

#[async_trait]
impl PolicyRepository for InMemoryPolicyRepository {
    async fn create(&self, policy: &Policy) -> Result<Policy, DbError> {
        let mut policies = self.policies.write().await;
        if policies.contains_key(&policy.id) {
            return Err(DbError::Constraint(format!(
                "Policy with id '{}' already exists",
                policy.id
            )));
        }
        policies.insert(policy.id, policy.clone());
        Ok(policy.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Policy>, DbError> {
        Ok(self.policies.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Policy>, DbError> {
        let mut result: Vec<Policy> = self.policies.read().await.values().cloned().collect();
        sort_by_precedence(&mut result);
        Ok(result)
    }

    async fn update(&self, id: Uuid, update: &PolicyUpdate) -> Result<Policy, DbError> {
        let mut policies = self.policies.write().await;
        let policy = policies
            .get_mut(&id)
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
        policy.updated_at = Utc::now();
        Ok(policy.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, DbError> {
        Ok(self.policies.write().await.remove(&id).is_some())
    }

    async fn list_candidates(
        &self,
        policy_type: PolicyType,
        wallet_id: Uuid,
        network: Option<&str>,
    ) -> Result<Vec<Policy>, DbError> {
        let policies = self.policies.read().await;
        let mut result: Vec<Policy> = policies
            .values()
            .filter(|p| p.enabled && p.policy_type() == policy_type)
            .filter(|p| p.wallet_id.map_or(true, |id| id == wallet_id))
            .filter(|p| match (&p.network, network) {
                (None, _) => true,
                (Some(scoped), Some(requested)) => scoped == requested,
                (Some(_), None) => false,
            })
            .cloned()
            .collect();
        sort_by_precedence(&mut result);
        Ok(result)
    }
}
