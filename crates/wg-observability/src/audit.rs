//! Audit trail for Wallet Guard.
//!
//! Every control-plane decision that changes state (a denial, a queued or
//! released transaction, an approval decision, an autostop suspension, a kill
//! switch transition) is appended here. Writers go through the [`AuditSink`]
//! trait so that the in-memory [`AuditLog`] can be swapped for a durable store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Errors raised by audit sinks.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Failed to write audit entry: {0}")]
    WriteFailed(String),
}

/// Types of auditable events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A request was denied by policy.
    PolicyDenied,
    /// A DELAY-tier transaction entered the queue.
    TransactionQueued,
    /// A delayed transaction was cancelled before its deadline.
    DelayCancelled,
    /// A delayed transaction reached its deadline and was released.
    DelayExpired,
    /// An APPROVAL-tier transaction is awaiting a decision.
    ApprovalRequested,
    /// An owner approved a held transaction.
    TransactionApproved,
    /// An owner rejected a held transaction.
    TransactionRejected,
    /// A pending approval timed out.
    ApprovalExpired,
    /// An autostop rule fired.
    AutoStopTriggered,
    /// An idle session was revoked.
    SessionRevoked,
    /// The kill switch moved ACTIVE -> SUSPENDED.
    KillSwitchActivated,
    /// The kill switch moved SUSPENDED -> LOCKED.
    KillSwitchEscalated,
    /// The kill switch returned to ACTIVE.
    KillSwitchRecovered,
    /// Every notification channel failed for one message.
    NotificationTotalFailure,
    /// Custom event.
    Custom(String),
}

/// Severity of an audit entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

/// An entry in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique entry ID.
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    /// User or system component responsible (e.g. "autostop", "admin").
    pub actor: String,
    pub wallet_id: Option<Uuid>,
    pub tx_id: Option<Uuid>,
    /// Structured details.
    pub details: serde_json::Value,
    pub severity: AuditSeverity,
}

impl AuditEntry {
    /// Creates an info-level entry with empty details.
    pub fn new(event_type: AuditEventType, actor: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            actor: actor.into(),
            wallet_id: None,
            tx_id: None,
            details: serde_json::json!({}),
            severity: AuditSeverity::Info,
        }
    }

    pub fn wallet(mut self, wallet_id: Uuid) -> Self {
        self.wallet_id = Some(wallet_id);
        self
    }

    pub fn tx(mut self, tx_id: Uuid) -> Self {
        self.tx_id = Some(tx_id);
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }
}

/// Destination for audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Appends an entry.
    async fn append(&self, entry: AuditEntry) -> Result<(), AuditError>;
}

/// Bounded in-memory audit log.
pub struct AuditLog {
    entries: Arc<RwLock<VecDeque<AuditEntry>>>,
    /// Maximum entries to keep in memory.
    max_entries: usize,
    /// Whether to also log to tracing.
    log_to_tracing: bool,
}

impl AuditLog {
    /// Creates a new audit log.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::with_capacity(max_entries))),
            max_entries,
            log_to_tracing: true,
        }
    }

    /// Creates an audit log without tracing output.
    pub fn without_tracing(max_entries: usize) -> Self {
        Self {
            log_to_tracing: false,
            ..Self::new(max_entries)
        }
    }

    /// Gets all entries, oldest first.
    pub async fn get_entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.iter().cloned().collect()
    }

    /// Gets entries for a specific wallet.
    pub async fn get_wallet_entries(&self, wallet_id: Uuid) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.wallet_id == Some(wallet_id))
            .cloned()
            .collect()
    }

    /// Gets entries by event type.
    pub async fn get_entries_by_type(&self, event_type: AuditEventType) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Gets entries at or above a severity.
    pub async fn get_entries_at_least(&self, severity: AuditSeverity) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.severity >= severity)
            .cloned()
            .collect()
    }

    /// Gets entries by actor.
    pub async fn get_entries_by_actor(&self, actor: &str) -> Vec<AuditEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .filter(|e| e.actor == actor)
            .cloned()
            .collect()
    }

    /// Exports entries as JSON.
    pub async fn export_json(&self) -> Result<String, AuditError> {
        let entries = self.get_entries().await;
        serde_json::to_string_pretty(&entries).map_err(|e| AuditError::WriteFailed(e.to_string()))
    }

    /// Gets the number of entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Checks if the audit log is empty.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Clears all entries.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(10000)
    }
}

#[async_trait]
impl AuditSink for AuditLog {
    async fn append(&self, entry: AuditEntry) -> Result<(), AuditError> {
        if self.log_to_tracing {
            match entry.severity {
                AuditSeverity::Info => info!(
                    event_type = ?entry.event_type,
                    actor = %entry.actor,
                    wallet_id = ?entry.wallet_id,
                    tx_id = ?entry.tx_id,
                    "Audit entry recorded"
                ),
                AuditSeverity::Warning | AuditSeverity::Critical => warn!(
                    event_type = ?entry.event_type,
                    actor = %entry.actor,
                    wallet_id = ?entry.wallet_id,
                    tx_id = ?entry.tx_id,
                    severity = ?entry.severity,
                    "Audit entry recorded"
                ),
            }
        }

        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_query() {
        let audit_log = AuditLog::without_tracing(100);
        let wallet_id = Uuid::new_v4();

        audit_log
            .append(
                AuditEntry::new(AuditEventType::AutoStopTriggered, "autostop")
                    .wallet(wallet_id)
                    .severity(AuditSeverity::Warning)
                    .details(serde_json::json!({"rule": "CONSECUTIVE_FAILURES"})),
            )
            .await
            .unwrap();
        audit_log
            .append(
                AuditEntry::new(AuditEventType::KillSwitchActivated, "ops")
                    .severity(AuditSeverity::Critical),
            )
            .await
            .unwrap();

        assert_eq!(audit_log.get_wallet_entries(wallet_id).await.len(), 1);
        assert_eq!(audit_log.get_entries_by_actor("ops").await.len(), 1);
        assert_eq!(
            audit_log.get_entries_at_least(AuditSeverity::Warning).await.len(),
            2
        );
        assert_eq!(
            audit_log.get_entries_at_least(AuditSeverity::Critical).await.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_max_entries() {
        let audit_log = AuditLog::without_tracing(5);

        for i in 0..10 {
            audit_log
                .append(AuditEntry::new(
                    AuditEventType::Custom(format!("event-{}", i)),
                    "test",
                ))
                .await
                .unwrap();
        }

        assert_eq!(audit_log.len().await, 5);

        // Oldest entries are evicted first.
        let entries = audit_log.get_entries().await;
        assert!(matches!(
            &entries[0].event_type,
            AuditEventType::Custom(s) if s == "event-5"
        ));
    }

    #[tokio::test]
    async fn test_export_json() {
        let audit_log = AuditLog::without_tracing(100);
        audit_log
            .append(AuditEntry::new(AuditEventType::PolicyDenied, "policy_engine"))
            .await
            .unwrap();

        let json = audit_log.export_json().await.unwrap();
        assert!(json.contains("policy_denied"));
        assert!(json.contains("\"severity\": \"info\""));
    }
}
