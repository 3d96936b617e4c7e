//! Owner approval workflow for APPROVAL-tier transactions.
//!
//! ```text
//! PENDING -> PENDING_APPROVAL -> EXECUTING   (approve)
//!                             -> CANCELLED   (reject)
//!                             -> CANCELLED   (expiry sweep, error "Approval expired")
//! ```
//!
//! Approve, reject and expire all resolve the pending approval row with a
//! conditional write. Whoever resolves it first wins; the others see `false`.

use crate::notifications::{NotificationEvent, NotificationGate};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use wg_core::db::{ApprovalRepository, DbError, TransactionRepository};
use wg_core::{
    time, ApprovalResolution, EventBus, EventBusError, LifecycleEvent, PendingApproval, Tier,
    Transaction, TransactionStatus, TransactionUpdate,
};
use wg_observability::{AuditEntry, AuditError, AuditEventType, AuditSink, ControlPlaneMetrics};

/// Approval window used when neither the policy nor the config names one.
pub const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 3600;

/// Error recorded on a transaction whose approval timed out.
pub const APPROVAL_EXPIRED_ERROR: &str = "Approval expired";

/// Errors that can occur in the approval workflow.
#[derive(Error, Debug)]
pub enum ApprovalError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("No pending approval for transaction {0}")]
    NotFound(Uuid),

    #[error("Transaction {tx_id} is {status}")]
    InvalidState {
        tx_id: Uuid,
        status: TransactionStatus,
    },

    #[error("Approval for transaction {0} has expired")]
    Expired(Uuid),

    #[error("Approval for transaction {0} is already resolved")]
    AlreadyResolved(Uuid),

    #[error("Approval timeout of {0} seconds is out of range")]
    InvalidTimeout(u64),
}

/// What the execution pipeline needs to know about a held transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalHandoff {
    pub tx_id: Uuid,
    pub approval_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Holds APPROVAL-tier transactions until an owner decides or time runs out.
pub struct ApprovalWorkflow {
    transactions: Arc<dyn TransactionRepository>,
    approvals: Arc<dyn ApprovalRepository>,
    events: Arc<EventBus>,
    audit: Arc<dyn AuditSink>,
    notifications: Arc<NotificationGate>,
    metrics: ControlPlaneMetrics,
    /// Configured default window; zero means unset.
    default_timeout_secs: u64,
}

impl ApprovalWorkflow {
    pub fn new(
        transactions: Arc<dyn TransactionRepository>,
        approvals: Arc<dyn ApprovalRepository>,
        events: Arc<EventBus>,
        audit: Arc<dyn AuditSink>,
        notifications: Arc<NotificationGate>,
        default_timeout_secs: u64,
    ) -> Self {
        Self {
            transactions,
            approvals,
            events,
            audit,
            notifications,
            metrics: ControlPlaneMetrics::new(),
            default_timeout_secs,
        }
    }

    /// Picks the approval window: policy, then config, then one hour.
    pub fn resolve_timeout(&self, policy_timeout: Option<u64>) -> u64 {
        policy_timeout
            .filter(|secs| *secs > 0)
            .or(Some(self.default_timeout_secs).filter(|secs| *secs > 0))
            .unwrap_or(DEFAULT_APPROVAL_TIMEOUT_SECS)
    }

    /// Holds a PENDING transaction for owner approval.
    ///
    /// Requesting approval for a transaction that already waits on one
    /// returns the existing handoff.
    #[instrument(skip(self), fields(tx_id = %tx_id))]
    pub async fn request_approval(
        &self,
        tx_id: Uuid,
        policy_timeout: Option<u64>,
    ) -> Result<ApprovalHandoff, ApprovalError> {
        let tx = self.load(tx_id).await?;
        if tx.status == TransactionStatus::PendingApproval {
            if let Some(existing) = self.approvals.get_by_tx(tx_id).await? {
                if existing.is_unresolved() {
                    debug!("Approval already requested");
                    return Ok(handoff(&existing));
                }
            }
        }
        if tx.status != TransactionStatus::Pending {
            return Err(ApprovalError::InvalidState {
                tx_id,
                status: tx.status,
            });
        }

        let now = Utc::now();
        let timeout = self.resolve_timeout(policy_timeout);
        let expires_at =
            time::checked_add_secs(now, timeout).ok_or(ApprovalError::InvalidTimeout(timeout))?;
        let reservation = tx.reserved_amount.clone().unwrap_or_else(|| tx.amount.clone());
        let update = TransactionUpdate {
            tier: Some(Tier::Approval),
            ..TransactionUpdate::to_status(TransactionStatus::PendingApproval)
        }
        .reserve(reservation);

        if !self
            .transactions
            .update_if_status(tx_id, &[TransactionStatus::Pending], &update)
            .await?
        {
            let status = self.load(tx_id).await?.status;
            return Err(ApprovalError::InvalidState { tx_id, status });
        }
        let approval = match self
            .approvals
            .create(&PendingApproval::new(tx_id, now, expires_at))
            .await
        {
            Ok(approval) => approval,
            Err(e) => {
                self.roll_back_hold(&tx).await;
                return Err(e.into());
            }
        };

        info!(
            wallet_id = %tx.wallet_id,
            timeout_secs = timeout,
            expires_at = %expires_at,
            "Approval requested"
        );

        self.events
            .publish(LifecycleEvent::ApprovalRequested {
                wallet_id: tx.wallet_id,
                tx_id,
                expires_at,
                at: now,
            })
            .await?;
        self.audit
            .append(
                AuditEntry::new(AuditEventType::ApprovalRequested, "approval_workflow")
                    .wallet(tx.wallet_id)
                    .tx(tx_id)
                    .details(serde_json::json!({
                        "approval_id": approval.id,
                        "expires_at": expires_at,
                        "amount": tx.amount,
                    })),
            )
            .await?;
        self.notifications
            .notify(
                NotificationEvent::TxApprovalRequired,
                Some(tx.wallet_id),
                serde_json::json!({
                    "txId": tx_id,
                    "expiresAt": expires_at,
                    "amount": tx.amount,
                    "to": tx.to_address,
                }),
            )
            .await;
        self.refresh_pending_gauge().await?;

        Ok(handoff(&approval))
    }

    /// Approves a held transaction and moves it to EXECUTING.
    ///
    /// Returns false if a concurrent decision or expiry got there first.
    #[instrument(skip(self), fields(tx_id = %tx_id))]
    pub async fn approve(&self, tx_id: Uuid, channel: Option<&str>) -> Result<bool, ApprovalError> {
        self.decide(tx_id, ApprovalResolution::Approved, channel).await
    }

    /// Rejects a held transaction and moves it to CANCELLED.
    ///
    /// Returns false if a concurrent decision or expiry got there first.
    #[instrument(skip(self), fields(tx_id = %tx_id))]
    pub async fn reject(&self, tx_id: Uuid, channel: Option<&str>) -> Result<bool, ApprovalError> {
        self.decide(tx_id, ApprovalResolution::Rejected, channel).await
    }

    async fn decide(
        &self,
        tx_id: Uuid,
        resolution: ApprovalResolution,
        channel: Option<&str>,
    ) -> Result<bool, ApprovalError> {
        let approval = self
            .approvals
            .get_by_tx(tx_id)
            .await?
            .ok_or(ApprovalError::NotFound(tx_id))?;
        if !approval.is_unresolved() {
            return Err(ApprovalError::AlreadyResolved(tx_id));
        }

        let now = Utc::now();
        if approval.expires_at <= now {
            // The sweep records the expiry.
            return Err(ApprovalError::Expired(tx_id));
        }

        if !self
            .approvals
            .resolve(approval.id, resolution, now, channel)
            .await?
        {
            debug!("Approval resolved concurrently");
            return Ok(false);
        }

        let (status, audit_type, notification, outcome) = match resolution {
            ApprovalResolution::Approved => (
                TransactionStatus::Executing,
                AuditEventType::TransactionApproved,
                NotificationEvent::TxApproved,
                "approved",
            ),
            _ => (
                TransactionStatus::Cancelled,
                AuditEventType::TransactionRejected,
                NotificationEvent::TxRejected,
                "rejected",
            ),
        };

        let tx = self
            .release(tx_id, TransactionUpdate::to_status(status).release_reservation())
            .await?;
        let Some(tx) = tx else {
            warn!(outcome, "Approval resolved but transaction was not awaiting approval");
            return Ok(false);
        };

        info!(wallet_id = %tx.wallet_id, outcome, channel = ?channel, "Approval resolved");
        self.metrics.record_approval_resolved(outcome);
        self.release_effects(&tx, outcome, audit_type, channel).await?;
        self.notifications
            .notify(notification, Some(tx.wallet_id), serde_json::json!({"txId": tx_id}))
            .await;
        self.refresh_pending_gauge().await?;
        Ok(true)
    }

    /// Expires every unresolved approval whose deadline is at or before
    /// `now`.
    ///
    /// Returns the transactions this call cancelled. A row that fails to
    /// move is logged and skipped; a failed audit or event for a row that did
    /// move is logged and the row is still returned.
    pub async fn process_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, ApprovalError> {
        let expired = self.approvals.list_expired(now).await?;
        let mut cancelled = Vec::new();

        for approval in expired {
            let tx = match self.expire_one(&approval, now).await {
                Ok(Some(tx)) => tx,
                Ok(None) => continue,
                Err(e) => {
                    error!(tx_id = %approval.tx_id, error = %e, "Failed to expire approval");
                    continue;
                }
            };

            self.metrics.record_approval_resolved("expired");
            if let Err(e) = self
                .release_effects(&tx, "expired", AuditEventType::ApprovalExpired, None)
                .await
            {
                error!(tx_id = %tx.id, error = %e, "Failed to record approval expiry");
            }
            self.notifications
                .notify(
                    NotificationEvent::TxApprovalExpired,
                    Some(tx.wallet_id),
                    serde_json::json!({"txId": tx.id, "expiredAt": now}),
                )
                .await;
            cancelled.push(tx);
        }

        if !cancelled.is_empty() {
            info!(count = cancelled.len(), "Expired pending approvals");
            self.refresh_pending_gauge().await?;
        }
        Ok(cancelled)
    }

    /// Unresolved approvals, oldest first.
    pub async fn list_pending(&self) -> Result<Vec<PendingApproval>, ApprovalError> {
        Ok(self.approvals.list_unresolved().await?)
    }

    async fn expire_one(
        &self,
        approval: &PendingApproval,
        now: DateTime<Utc>,
    ) -> Result<Option<Transaction>, ApprovalError> {
        if !self
            .approvals
            .resolve(approval.id, ApprovalResolution::Expired, now, None)
            .await?
        {
            return Ok(None);
        }
        let update = TransactionUpdate::to_status(TransactionStatus::Cancelled)
            .release_reservation()
            .with_error(APPROVAL_EXPIRED_ERROR);
        self.release(approval.tx_id, update).await
    }

    /// Returns a transaction held without an approval row to PENDING with the
    /// reservation it had before the hold.
    async fn roll_back_hold(&self, before: &Transaction) {
        let update = TransactionUpdate {
            reserved_amount: Some(before.reserved_amount.clone()),
            ..TransactionUpdate::to_status(TransactionStatus::Pending)
        };
        match self
            .transactions
            .update_if_status(before.id, &[TransactionStatus::PendingApproval], &update)
            .await
        {
            Ok(true) => warn!(tx_id = %before.id, "Approval not recorded, hold rolled back"),
            Ok(false) => warn!(tx_id = %before.id, "Approval not recorded, hold already moved"),
            Err(e) => error!(tx_id = %before.id, error = %e, "Failed to roll back approval hold"),
        }
    }

    async fn load(&self, tx_id: Uuid) -> Result<Transaction, ApprovalError> {
        self.transactions
            .get(tx_id)
            .await?
            .ok_or(ApprovalError::NotFound(tx_id))
    }

    /// Applies `update` to a PENDING_APPROVAL transaction and returns the
    /// updated row, or None if the row was not awaiting approval.
    async fn release(
        &self,
        tx_id: Uuid,
        update: TransactionUpdate,
    ) -> Result<Option<Transaction>, ApprovalError> {
        if !self
            .transactions
            .update_if_status(tx_id, &[TransactionStatus::PendingApproval], &update)
            .await?
        {
            return Ok(None);
        }
        Ok(self.transactions.get(tx_id).await?)
    }

    async fn release_effects(
        &self,
        tx: &Transaction,
        outcome: &str,
        audit_type: AuditEventType,
        channel: Option<&str>,
    ) -> Result<(), ApprovalError> {
        self.events
            .publish(LifecycleEvent::TransactionReleased {
                wallet_id: tx.wallet_id,
                tx_id: tx.id,
                status: tx.status,
                reason: outcome.to_string(),
                at: Utc::now(),
            })
            .await?;
        self.audit
            .append(
                AuditEntry::new(audit_type, channel.unwrap_or("approval_workflow"))
                    .wallet(tx.wallet_id)
                    .tx(tx.id)
                    .details(serde_json::json!({"status": tx.status, "outcome": outcome})),
            )
            .await?;
        Ok(())
    }

    async fn refresh_pending_gauge(&self) -> Result<(), ApprovalError> {
        let pending = self.approvals.list_unresolved().await?;
        self.metrics.record_pending_approvals(pending.len());
        Ok(())
    }
}

fn handoff(approval: &PendingApproval) -> ApprovalHandoff {
    ApprovalHandoff {
        tx_id: approval.tx_id,
        approval_id: approval.id,
        expires_at: approval.expires_at,
    }
}
