//! In-memory KillSwitchRepository.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::db::{DbError, KillSwitchRepository};
use crate::kill_switch::{KillSwitchRecord, KillSwitchState};

/// KillSwitchRepository holding the record behind a lock.
#[derive(Clone, Default)]
pub struct InMemoryKillSwitchRepository {
    record: Arc<RwLock<KillSwitchRecord>>,
}

impl InMemoryKillSwitchRepository {
    /// Creates a repository in the ACTIVE state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a repository starting from `record`.
    pub fn with_record(record: KillSwitchRecord) -> Self {
        Self {
            record: Arc::new(RwLock::new(record)),
        }
    }
}

#[async_trait]
impl KillSwitchRepository for InMemoryKillSwitchRepository {
    async fn load(&self) -> Result<KillSwitchRecord, DbError> {
        Ok(self.record.read().await.clone())
    }

    async fn compare_and_set(
        &self,
        expected: KillSwitchState,
        record: &KillSwitchRecord,
    ) -> Result<bool, DbError> {
        let mut current = self.record.write().await;
        if current.state != expected {
            return Ok(false);
        }
        *current = record.clone();
        Ok(true)
    }
}
