//! In-memory ApprovalRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::{ApprovalRepository, DbError};
use crate::transaction::{ApprovalResolution, PendingApproval};

/// ApprovalRepository backed by a HashMap.
#[derive(Clone)]
pub struct InMemoryApprovalRepository {
    approvals: Arc<RwLock<HashMap<Uuid, PendingApproval>>>,
}

impl Default for InMemoryApprovalRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryApprovalRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self {
            approvals: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Gets a snapshot of all stored approvals.
    pub async fn snapshot(&self) -> Vec<PendingApproval> {
        self.approvals.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl ApprovalRepository for InMemoryApprovalRepository {
    async fn create(&self, approval: &PendingApproval) -> Result<PendingApproval, DbError> {
        let mut approvals = self.approvals.write().await;
        if approvals
            .values()
            .any(|a| a.tx_id == approval.tx_id && a.is_unresolved())
        {
            return Err(DbError::Constraint(format!(
                "Transaction '{}' already has an unresolved approval",
                approval.tx_id
            )));
        }
        approvals.insert(approval.id, approval.clone());
        Ok(approval.clone())
    }

    async fn get_by_tx(&self, tx_id: Uuid) -> Result<Option<PendingApproval>, DbError> {
        let approvals = self.approvals.read().await;
        Ok(approvals
            .values()
            .filter(|a| a.tx_id == tx_id)
            .max_by_key(|a| a.created_at)
            .cloned())
    }

    async fn resolve(
        &self,
        id: Uuid,
        resolution: ApprovalResolution,
        at: DateTime<Utc>,
        channel: Option<&str>,
    ) -> Result<bool, DbError> {
        let mut approvals = self.approvals.write().await;
        let Some(approval) = approvals.get_mut(&id) else {
            return Ok(false);
        };
        if !approval.is_unresolved() {
            return Ok(false);
        }

        match resolution {
            ApprovalResolution::Approved => approval.approved_at = Some(at),
            ApprovalResolution::Rejected => approval.rejected_at = Some(at),
            ApprovalResolution::Expired => approval.expired_at = Some(at),
        }
        if let Some(channel) = channel {
            approval.approval_channel = Some(channel.to_string());
        }
        Ok(true)
    }

    async fn list_unresolved(&self) -> Result<Vec<PendingApproval>, DbError> {
        let approvals = self.approvals.read().await;
        let mut result: Vec<PendingApproval> = approvals
            .values()
            .filter(|a| a.is_unresolved())
            .cloned()
            .collect();
        result.sort_by_key(|a| a.created_at);
        Ok(result)
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<PendingApproval>, DbError> {
        let approvals = self.approvals.read().await;
        let mut result: Vec<PendingApproval> = approvals
            .values()
            .filter(|a| a.is_unresolved() && a.expires_at <= now)
            .cloned()
            .collect();
        result.sort_by_key(|a| a.expires_at);
        Ok(result)
    }
}
