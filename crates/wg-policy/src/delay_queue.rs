//! Delay queue for DELAY-tier transactions.
//!
//! A DELAY-tier transaction waits out a cooldown in QUEUED before it is
//! released to execution. During the cooldown the owner may cancel it.
//!
//! ```text
//! PENDING -> QUEUED -> EXECUTING   (sweep, once delay_until has passed)
//!                   -> CANCELLED   (owner cancel)
//! ```
//!
//! Every transition is a conditional update on the row's status, so a sweep
//! racing a cancel (or a second sweep) moves each row at most once.

use crate::notifications::{NotificationEvent, NotificationGate};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;
use wg_core::db::{DbError, TransactionRepository};
use wg_core::{
    time, EventBus, EventBusError, LifecycleEvent, Tier, Transaction, TransactionStatus,
    TransactionUpdate,
};
use wg_observability::{AuditEntry, AuditError, AuditEventType, AuditSink, ControlPlaneMetrics};

/// Errors that can occur in the delay queue.
#[derive(Error, Debug)]
pub enum DelayQueueError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("Transaction {0} not found")]
    NotFound(Uuid),

    #[error("Delay of {0} seconds is out of range")]
    InvalidDelay(u64),

    #[error("Transaction {tx_id} is {status}, not {expected}")]
    InvalidState {
        tx_id: Uuid,
        status: TransactionStatus,
        expected: TransactionStatus,
    },
}

/// What the execution pipeline needs to know about a queued transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayHandoff {
    pub tx_id: Uuid,
    pub wallet_id: Uuid,
    pub delay_until: DateTime<Utc>,
}

/// Holds DELAY-tier transactions until their cooldown elapses.
pub struct DelayQueue {
    transactions: Arc<dyn TransactionRepository>,
    events: Arc<EventBus>,
    audit: Arc<dyn AuditSink>,
    notifications: Arc<NotificationGate>,
    metrics: ControlPlaneMetrics,
}

impl DelayQueue {
    pub fn new(
        transactions: Arc<dyn TransactionRepository>,
        events: Arc<EventBus>,
        audit: Arc<dyn AuditSink>,
        notifications: Arc<NotificationGate>,
    ) -> Self {
        Self {
            transactions,
            events,
            audit,
            notifications,
            metrics: ControlPlaneMetrics::new(),
        }
    }

    /// Moves a PENDING transaction into the queue.
    ///
    /// Enqueueing a transaction that is already QUEUED returns its existing
    /// handoff and has no side effects.
    #[instrument(skip(self), fields(tx_id = %tx_id))]
    pub async fn enqueue(
        &self,
        tx_id: Uuid,
        delay_seconds: u64,
    ) -> Result<DelayHandoff, DelayQueueError> {
        let tx = self.load(tx_id).await?;
        if let Some(handoff) = existing_handoff(&tx) {
            debug!("Transaction already queued");
            return Ok(handoff);
        }
        if tx.status != TransactionStatus::Pending {
            return Err(DelayQueueError::InvalidState {
                tx_id,
                status: tx.status,
                expected: TransactionStatus::Pending,
            });
        }

        let now = Utc::now();
        let delay_until = time::checked_add_secs(now, delay_seconds)
            .ok_or(DelayQueueError::InvalidDelay(delay_seconds))?;
        let reservation = tx.reserved_amount.clone().unwrap_or_else(|| tx.amount.clone());
        let update = TransactionUpdate {
            tier: Some(Tier::Delay),
            queued_at: Some(Some(now)),
            delay_until: Some(Some(delay_until)),
            ..TransactionUpdate::to_status(TransactionStatus::Queued)
        }
        .reserve(reservation);

        if !self
            .transactions
            .update_if_status(tx_id, &[TransactionStatus::Pending], &update)
            .await?
        {
            // Lost a race; a concurrent enqueue of the same id is still a success.
            let current = self.load(tx_id).await?;
            return existing_handoff(&current).ok_or(DelayQueueError::InvalidState {
                tx_id,
                status: current.status,
                expected: TransactionStatus::Pending,
            });
        }

        info!(
            wallet_id = %tx.wallet_id,
            delay_seconds,
            delay_until = %delay_until,
            "Transaction queued"
        );

        self.events
            .publish(LifecycleEvent::TransactionQueued {
                wallet_id: tx.wallet_id,
                tx_id,
                delay_until,
                at: now,
            })
            .await?;
        self.audit
            .append(
                AuditEntry::new(AuditEventType::TransactionQueued, "delay_queue")
                    .wallet(tx.wallet_id)
                    .tx(tx_id)
                    .details(serde_json::json!({
                        "delay_seconds": delay_seconds,
                        "delay_until": delay_until,
                        "amount": tx.amount,
                    })),
            )
            .await?;
        self.notifications
            .notify(
                NotificationEvent::TxQueued,
                Some(tx.wallet_id),
                serde_json::json!({
                    "txId": tx_id,
                    "delayUntil": delay_until,
                    "amount": tx.amount,
                    "to": tx.to_address,
                }),
            )
            .await;

        Ok(DelayHandoff {
            tx_id,
            wallet_id: tx.wallet_id,
            delay_until,
        })
    }

    /// Cancels a QUEUED transaction during its cooldown.
    #[instrument(skip(self), fields(tx_id = %tx_id))]
    pub async fn cancel_delay(&self, tx_id: Uuid) -> Result<(), DelayQueueError> {
        let tx = self.load(tx_id).await?;
        let update = TransactionUpdate::to_status(TransactionStatus::Cancelled)
            .release_reservation()
            .with_error("Cancelled during delay");

        if tx.status != TransactionStatus::Queued
            || !self
                .transactions
                .update_if_status(tx_id, &[TransactionStatus::Queued], &update)
                .await?
        {
            let status = self.load(tx_id).await?.status;
            return Err(DelayQueueError::InvalidState {
                tx_id,
                status,
                expected: TransactionStatus::Queued,
            });
        }

        info!(wallet_id = %tx.wallet_id, "Delayed transaction cancelled");
        self.release_effects(
            &tx,
            TransactionStatus::Cancelled,
            "cancelled",
            AuditEventType::DelayCancelled,
        )
        .await?;
        self.notifications
            .notify(
                NotificationEvent::TxDelayCancelled,
                Some(tx.wallet_id),
                serde_json::json!({"txId": tx_id}),
            )
            .await;
        Ok(())
    }

    /// Moves every QUEUED transaction whose cooldown has elapsed at `now` to
    /// EXECUTING and returns the rows this call actually moved.
    ///
    /// A row that fails to move is logged and skipped. A failed audit or event
    /// for a row that did move is logged and the row is still returned.
    pub async fn process_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, DelayQueueError> {
        let due = self.transactions.list_due_delays(now).await?;
        if due.is_empty() {
            return Ok(Vec::new());
        }

        let update =
            TransactionUpdate::to_status(TransactionStatus::Executing).release_reservation();
        let mut released = Vec::with_capacity(due.len());
        for mut tx in due {
            match self
                .transactions
                .update_if_status(tx.id, &[TransactionStatus::Queued], &update)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(tx_id = %tx.id, "Delayed transaction already moved");
                    continue;
                }
                Err(e) => {
                    error!(tx_id = %tx.id, error = %e, "Failed to release delayed transaction");
                    continue;
                }
            }
            update.apply(&mut tx);
            if let Err(e) = self
                .release_effects(
                    &tx,
                    TransactionStatus::Executing,
                    "delay expired",
                    AuditEventType::DelayExpired,
                )
                .await
            {
                error!(tx_id = %tx.id, error = %e, "Failed to record delay release");
            }
            released.push(tx);
        }

        if !released.is_empty() {
            info!(count = released.len(), "Released delayed transactions");
            self.metrics.record_delay_released(released.len());
        }
        Ok(released)
    }

    /// Returns true if the transaction is QUEUED and its cooldown has
    /// elapsed at `now`.
    pub async fn is_expired(
        &self,
        tx_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DelayQueueError> {
        Ok(self
            .transactions
            .get(tx_id)
            .await?
            .filter(|tx| tx.status == TransactionStatus::Queued)
            .and_then(|tx| tx.delay_until)
            .is_some_and(|until| until <= now))
    }

    async fn load(&self, tx_id: Uuid) -> Result<Transaction, DelayQueueError> {
        self.transactions
            .get(tx_id)
            .await?
            .ok_or(DelayQueueError::NotFound(tx_id))
    }

    async fn release_effects(
        &self,
        tx: &Transaction,
        status: TransactionStatus,
        reason: &str,
        audit_type: AuditEventType,
    ) -> Result<(), DelayQueueError> {
        self.events
            .publish(LifecycleEvent::TransactionReleased {
                wallet_id: tx.wallet_id,
                tx_id: tx.id,
                status,
                reason: reason.to_string(),
                at: Utc::now(),
            })
            .await?;
        self.audit
            .append(
                AuditEntry::new(audit_type, "delay_queue")
                    .wallet(tx.wallet_id)
                    .tx(tx.id)
                    .details(serde_json::json!({"status": status, "reason": reason})),
            )
            .await?;
        Ok(())
    }
}

fn existing_handoff(tx: &Transaction) -> Option<DelayHandoff> {
    if tx.status != TransactionStatus::Queued {
        return None;
    }
    tx.delay_until.map(|delay_until| DelayHandoff {
        tx_id: tx.id,
        wallet_id: tx.wallet_id,
        delay_until,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::LogNotifier;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicBool, Ordering};
    use wg_core::db::memory::{InMemoryKillSwitchRepository, InMemoryTransactionRepository};
    use wg_core::{Amount, TransactionRequest};
    use wg_observability::AuditLog;

    /// Audit sink that starts failing once `fail` is set.
    #[derive(Default)]
    struct FlakyAudit {
        inner: AuditLog,
        fail: AtomicBool,
    }

    #[async_trait]
    impl AuditSink for FlakyAudit {
        async fn append(&self, entry: AuditEntry) -> Result<(), AuditError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AuditError::WriteFailed("disk full".to_string()));
            }
            self.inner.append(entry).await
        }
    }

    struct Harness {
        queue: DelayQueue,
        transactions: InMemoryTransactionRepository,
        events: Arc<EventBus>,
        audit: Arc<AuditLog>,
        gate: Arc<NotificationGate>,
    }

    fn create_queue() -> Harness {
        let transactions = InMemoryTransactionRepository::new();
        let events = Arc::new(EventBus::new(64));
        let audit = Arc::new(AuditLog::without_tracing(100));
        let gate = Arc::new(NotificationGate::new(
            Arc::new(LogNotifier::new("log")),
            Arc::new(InMemoryKillSwitchRepository::new()),
            audit.clone(),
            0,
        ));
        let queue = DelayQueue::new(
            Arc::new(transactions.clone()),
            events.clone(),
            audit.clone(),
            gate.clone(),
        );
        Harness {
            queue,
            transactions,
            events,
            audit,
            gate,
        }
    }

    async fn pending(h: &Harness, amount: u64) -> Transaction {
        let request = TransactionRequest::transfer("0xdest", amount);
        let tx = Transaction::pending(Uuid::new_v4(), &request);
        h.transactions.create(&tx).await.unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_sets_queue_fields() {
        let h = create_queue();
        let tx = pending(&h, 700).await;

        let handoff = h.queue.enqueue(tx.id, 900).await.unwrap();
        assert_eq!(handoff.wallet_id, tx.wallet_id);

        let stored = h.transactions.get(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Queued);
        assert_eq!(stored.tier, Some(Tier::Delay));
        assert_eq!(stored.reserved_amount, Some(Amount::from(700u64)));
        assert_eq!(stored.delay_until, Some(handoff.delay_until));
        let queued_at = stored.queued_at.unwrap();
        assert_eq!(handoff.delay_until - queued_at, Duration::seconds(900));

        assert_eq!(h.events.get_wallet_events(tx.wallet_id).await.len(), 1);
        assert_eq!(h.audit.get_entries_by_type(AuditEventType::TransactionQueued).await.len(), 1);
        assert_eq!(h.gate.dispatched_count(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let h = create_queue();
        let tx = pending(&h, 1).await;

        let first = h.queue.enqueue(tx.id, 60).await.unwrap();
        let second = h.queue.enqueue(tx.id, 600).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.audit.len().await, 1);
        assert_eq!(h.events.get_history(None).await.len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_unknown_or_wrong_state() {
        let h = create_queue();
        assert!(matches!(
            h.queue.enqueue(Uuid::new_v4(), 60).await,
            Err(DelayQueueError::NotFound(_))
        ));

        let tx = pending(&h, 1).await;
        h.transactions
            .update_if_status(
                tx.id,
                &[TransactionStatus::Pending],
                &TransactionUpdate::to_status(TransactionStatus::Executing),
            )
            .await
            .unwrap();
        assert!(matches!(
            h.queue.enqueue(tx.id, 60).await,
            Err(DelayQueueError::InvalidState { status: TransactionStatus::Executing, .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_releases_reservation() {
        let h = create_queue();
        let tx = pending(&h, 50).await;
        h.queue.enqueue(tx.id, 900).await.unwrap();

        h.queue.cancel_delay(tx.id).await.unwrap();
        let stored = h.transactions.get(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Cancelled);
        assert!(stored.reserved_amount.is_none());
        assert_eq!(h.transactions.reserved_total(tx.wallet_id).await.unwrap(), Amount::zero());

        // Cancelling twice is a state error, not a second cancellation.
        assert!(matches!(
            h.queue.cancel_delay(tx.id).await,
            Err(DelayQueueError::InvalidState { status: TransactionStatus::Cancelled, .. })
        ));
        assert_eq!(h.audit.get_entries_by_type(AuditEventType::DelayCancelled).await.len(), 1);
    }

    #[tokio::test]
    async fn test_process_expired_moves_each_row_once() {
        let h = create_queue();
        let due = pending(&h, 10).await;
        let later = pending(&h, 20).await;
        h.queue.enqueue(due.id, 0).await.unwrap();
        h.queue.enqueue(later.id, 3600).await.unwrap();

        let now = Utc::now() + Duration::seconds(1);
        assert!(h.queue.is_expired(due.id, now).await.unwrap());
        assert!(!h.queue.is_expired(later.id, now).await.unwrap());

        let released = h.queue.process_expired(now).await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id, due.id);
        assert_eq!(released[0].status, TransactionStatus::Executing);
        assert!(released[0].reserved_amount.is_none());

        assert!(h.queue.process_expired(now).await.unwrap().is_empty());
        assert!(!h.queue.is_expired(due.id, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_row_is_not_released() {
        let h = create_queue();
        let tx = pending(&h, 10).await;
        h.queue.enqueue(tx.id, 0).await.unwrap();
        h.queue.cancel_delay(tx.id).await.unwrap();

        let released = h
            .queue
            .process_expired(Utc::now() + Duration::seconds(5))
            .await
            .unwrap();
        assert!(released.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_delay_is_rejected() {
        let h = create_queue();
        let tx = pending(&h, 10).await;

        // u64::MAX does not fit a duration; 2^50 seconds overflows the timestamp.
        for delay in [u64::MAX, 1 << 50] {
            assert!(matches!(
                h.queue.enqueue(tx.id, delay).await,
                Err(DelayQueueError::InvalidDelay(d)) if d == delay
            ));
        }

        let stored = h.transactions.get(tx.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Pending);
        assert!(stored.delay_until.is_none());
        assert!(!h.queue.is_expired(tx.id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_process_expired_survives_audit_failure() {
        let transactions = InMemoryTransactionRepository::new();
        let audit = Arc::new(FlakyAudit::default());
        let gate = Arc::new(NotificationGate::new(
            Arc::new(LogNotifier::new("log")),
            Arc::new(InMemoryKillSwitchRepository::new()),
            audit.clone(),
            0,
        ));
        let queue = DelayQueue::new(
            Arc::new(transactions.clone()),
            Arc::new(EventBus::new(64)),
            audit.clone(),
            gate,
        );

        let mut ids = Vec::new();
        for amount in [10u64, 20, 30] {
            let request = TransactionRequest::transfer("0xdest", amount);
        let tx = Transaction::pending(Uuid::new_v4(), &request);
            let tx = transactions.create(&tx).await.unwrap();
            queue.enqueue(tx.id, 0).await.unwrap();
            ids.push(tx.id);
        }

        audit.fail.store(true, Ordering::SeqCst);
        let released = queue
            .process_expired(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(released.len(), 3);
        for id in ids {
            assert!(released.iter().any(|tx| tx.id == id));
            let stored = transactions.get(id).await.unwrap().unwrap();
            assert_eq!(stored.status, TransactionStatus::Executing);
        }
    }
}
