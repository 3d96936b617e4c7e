//! In-memory TransactionRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::amount::Amount;
use crate::db::{DbError, TransactionRepository};
use crate::transaction::{Transaction, TransactionStatus, TransactionUpdate};

/// TransactionRepository backed by a HashMap.
#[derive(Clone)]
pub struct InMemoryTransactionRepository {
    transactions: Arc<RwLock<HashMap<Uuid, Transaction>>>,
}

impl Default for InMemoryTransactionRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransactionRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self {
            transactions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Gets a snapshot of all stored transactions.
    pub async fn snapshot(&self) -> Vec<Transaction> {
        self.transactions.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl TransactionRepository for InMemoryTransactionRepository {
    async fn create(&self, tx: &Transaction) -> Result<Transaction, DbError> {
        let mut transactions = self.transactions.write().await;
        if transactions.contains_key(&tx.id) {
            return Err(DbError::Constraint(format!(
                "Transaction with id '{}' already exists",
                tx.id
            )));
        }
        transactions.insert(tx.id, tx.clone());
        Ok(tx.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Transaction>, DbError> {
        Ok(self.transactions.read().await.get(&id).cloned())
    }

    async fn update_if_status(
        &self,
        id: Uuid,
        expected: &[TransactionStatus],
        update: &TransactionUpdate,
    ) -> Result<bool, DbError> {
        let mut transactions = self.transactions.write().await;
        match transactions.get_mut(&id) {
            Some(tx) if expected.contains(&tx.status) => {
                update.apply(tx);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_due_delays(&self, now: DateTime<Utc>) -> Result<Vec<Transaction>, DbError> {
        let transactions = self.transactions.read().await;
        let mut due: Vec<Transaction> = transactions
            .values()
            .filter(|tx| tx.status == TransactionStatus::Queued)
            .filter(|tx| tx.delay_until.is_some_and(|until| until <= now))
            .cloned()
            .collect();
        due.sort_by_key(|tx| tx.delay_until);
        Ok(due)
    }

    async fn list_by_status(
        &self,
        statuses: &[TransactionStatus],
    ) -> Result<Vec<Transaction>, DbError> {
        let transactions = self.transactions.read().await;
        let mut result: Vec<Transaction> = transactions
            .values()
            .filter(|tx| statuses.contains(&tx.status))
            .cloned()
            .collect();
        result.sort_by_key(|tx| tx.created_at);
        Ok(result)
    }

    async fn list_for_wallet(&self, wallet_id: Uuid) -> Result<Vec<Transaction>, DbError> {
        let transactions = self.transactions.read().await;
        let mut result: Vec<Transaction> = transactions
            .values()
            .filter(|tx| tx.wallet_id == wallet_id)
            .cloned()
            .collect();
        result.sort_by_key(|tx| tx.created_at);
        Ok(result)
    }

    async fn reserved_total(&self, wallet_id: Uuid) -> Result<Amount, DbError> {
        let transactions = self.transactions.read().await;
        Ok(transactions
            .values()
            .filter(|tx| tx.wallet_id == wallet_id && tx.status.holds_reservation())
            .filter_map(|tx| tx.reserved_amount.as_ref())
            .sum())
    }
}
