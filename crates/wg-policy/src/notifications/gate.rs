//! Kill-switch-aware notification gate.
//!
//! The gate answers one question per call: may this notification go out now?
//! It reads the kill switch record fresh on every call and mutes everything
//! while the switch is not ACTIVE. It also drops repeats of the same event
//! type for the same wallet inside the cooldown window. Delivery happens on a
//! spawned task and is never awaited by the caller.

use super::{Notification, NotificationEvent, Notifier};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;
use wg_core::db::KillSwitchRepository;
use wg_core::{time, KillSwitchState};
use wg_observability::{AuditEntry, AuditEventType, AuditSeverity, AuditSink, ControlPlaneMetrics};

/// What the gate decided for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Handed to the notifier.
    Dispatched,
    /// Muted because the kill switch is not ACTIVE (or could not be read).
    SuppressedByKillSwitch,
    /// Muted because the same event was sent for the wallet recently.
    SuppressedByCooldown,
    /// The gate has been stopped.
    Stopped,
}

type CooldownKey = (Option<Uuid>, NotificationEvent);

/// Decides whether notifications may be sent and dispatches them.
pub struct NotificationGate {
    notifier: Arc<dyn Notifier>,
    kill_switch: Arc<dyn KillSwitchRepository>,
    audit: Arc<dyn AuditSink>,
    metrics: ControlPlaneMetrics,
    cooldown: Duration,
    last_sent: Mutex<HashMap<CooldownKey, DateTime<Utc>>>,
    stopped: AtomicBool,
    dispatched: AtomicU64,
    suppressed: AtomicU64,
}

impl NotificationGate {
    /// Creates a gate. A zero cooldown disables de-duplication.
    pub fn new(
        notifier: Arc<dyn Notifier>,
        kill_switch: Arc<dyn KillSwitchRepository>,
        audit: Arc<dyn AuditSink>,
        cooldown_secs: u64,
    ) -> Self {
        Self {
            notifier,
            kill_switch,
            audit,
            metrics: ControlPlaneMetrics::new(),
            cooldown: time::saturating_seconds(cooldown_secs),
            last_sent: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            dispatched: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Fire-and-forget notification.
    pub async fn notify(
        &self,
        event_type: NotificationEvent,
        wallet_id: Option<Uuid>,
        details: serde_json::Value,
    ) -> NotifyOutcome {
        if self.stopped.load(Ordering::SeqCst) {
            return NotifyOutcome::Stopped;
        }

        match self.kill_switch.load().await {
            Ok(record) if record.state == KillSwitchState::Active => {}
            Ok(record) => {
                debug!(
                    event_type = %event_type,
                    kill_switch = %record.state,
                    "Notification suppressed by kill switch"
                );
                return self.suppress(NotifyOutcome::SuppressedByKillSwitch, "kill_switch");
            }
            Err(e) => {
                warn!(error = %e, "Kill switch state unavailable, suppressing notification");
                return self.suppress(NotifyOutcome::SuppressedByKillSwitch, "kill_switch");
            }
        }

        if !self.admit((wallet_id, event_type), Utc::now()).await {
            debug!(
                event_type = %event_type,
                wallet_id = ?wallet_id,
                "Notification in cooldown"
            );
            return self.suppress(NotifyOutcome::SuppressedByCooldown, "cooldown");
        }

        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_notification_dispatched(event_type.as_str());

        let notification = Notification::new(event_type, wallet_id, details);
        let notifier = self.notifier.clone();
        let audit = self.audit.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.send(&notification).await {
                error!(
                    event_type = %notification.event_type,
                    error = %e,
                    "All notification channels failed"
                );
                let mut entry =
                    AuditEntry::new(AuditEventType::NotificationTotalFailure, "notifications")
                        .severity(AuditSeverity::Critical)
                        .details(serde_json::json!({
                            "event_type": notification.event_type,
                            "error": e.to_string(),
                        }));
                if let Some(wallet_id) = notification.wallet_id {
                    entry = entry.wallet(wallet_id);
                }
                if let Err(e) = audit.append(entry).await {
                    error!(error = %e, "Failed to record notification failure");
                }
            }
        });

        NotifyOutcome::Dispatched
    }

    /// Records a send for `key` at `now` unless one is still inside the
    /// cooldown. Entries whose cooldown has elapsed are dropped.
    async fn admit(&self, key: CooldownKey, now: DateTime<Utc>) -> bool {
        if self.cooldown <= Duration::zero() {
            return true;
        }
        let cooldown = self.cooldown;
        let mut last_sent = self.last_sent.lock().await;
        last_sent.retain(|_, sent| now.signed_duration_since(*sent) < cooldown);
        if last_sent.contains_key(&key) {
            return false;
        }
        last_sent.insert(key, now);
        true
    }

    /// Number of (wallet, event) pairs currently inside their cooldown.
    pub async fn cooldown_entries(&self) -> usize {
        self.last_sent.lock().await.len()
    }

    fn suppress(&self, outcome: NotifyOutcome, reason: &'static str) -> NotifyOutcome {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_notification_suppressed(reason);
        outcome
    }

    /// Stops the gate and clears its cooldown state.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.last_sent.lock().await.clear();
    }

    /// Re-opens a stopped gate.
    pub fn start(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    /// Clears cooldown state without stopping.
    pub async fn clear(&self) {
        self.last_sent.lock().await.clear();
    }

    /// Number of notifications handed to the notifier.
    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Number of notifications suppressed for any reason.
    pub fn suppressed_count(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::NotificationError;
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use wg_core::db::memory::InMemoryKillSwitchRepository;
    use wg_core::KillSwitchRecord;
    use wg_observability::AuditLog;

    struct RecordingNotifier {
        tx: mpsc::UnboundedSender<Notification>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
            let _ = self.tx.send(notification.clone());
            if self.fail {
                Err(NotificationError::SendFailed("down".to_string()))
            } else {
                Ok(())
            }
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    fn create_gate(
        state: KillSwitchState,
        cooldown_secs: u64,
        fail: bool,
    ) -> (NotificationGate, mpsc::UnboundedReceiver<Notification>, Arc<AuditLog>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let record = KillSwitchRecord {
            state,
            ..KillSwitchRecord::active()
        };
        let audit = Arc::new(AuditLog::without_tracing(100));
        let gate = NotificationGate::new(
            Arc::new(RecordingNotifier { tx, fail }),
            Arc::new(InMemoryKillSwitchRepository::with_record(record)),
            audit.clone(),
            cooldown_secs,
        );
        (gate, rx, audit)
    }

    #[tokio::test]
    async fn test_dispatches_when_active() {
        let (gate, mut rx, _) = create_gate(KillSwitchState::Active, 0, false);
        let wallet_id = Uuid::new_v4();

        let outcome = gate
            .notify(NotificationEvent::TxQueued, Some(wallet_id), serde_json::json!({}))
            .await;
        assert_eq!(outcome, NotifyOutcome::Dispatched);

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.wallet_id, Some(wallet_id));
        assert_eq!(gate.dispatched_count(), 1);
    }

    #[tokio::test]
    async fn test_muted_while_kill_switch_tripped() {
        for state in [KillSwitchState::Suspended, KillSwitchState::Locked] {
            let (gate, mut rx, _) = create_gate(state, 0, false);
            let outcome = gate
                .notify(NotificationEvent::KillSwitchActivated, None, serde_json::json!({}))
                .await;
            assert_eq!(outcome, NotifyOutcome::SuppressedByKillSwitch);
            assert_eq!(gate.suppressed_count(), 1);
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_cooldown_per_wallet_and_event() {
        let (gate, _rx, _) = create_gate(KillSwitchState::Active, 300, false);
        let wallet_a = Some(Uuid::new_v4());
        let wallet_b = Some(Uuid::new_v4());
        let details = serde_json::json!({});

        assert_eq!(
            gate.notify(NotificationEvent::TxQueued, wallet_a, details.clone()).await,
            NotifyOutcome::Dispatched
        );
        assert_eq!(
            gate.notify(NotificationEvent::TxQueued, wallet_a, details.clone()).await,
            NotifyOutcome::SuppressedByCooldown
        );
        assert_eq!(
            gate.notify(NotificationEvent::TxApprovalRequired, wallet_a, details.clone()).await,
            NotifyOutcome::Dispatched
        );
        assert_eq!(
            gate.notify(NotificationEvent::TxQueued, wallet_b, details.clone()).await,
            NotifyOutcome::Dispatched
        );

        gate.clear().await;
        assert_eq!(
            gate.notify(NotificationEvent::TxQueued, wallet_a, details).await,
            NotifyOutcome::Dispatched
        );
    }

    #[tokio::test]
    async fn test_stop_blocks_and_clears() {
        let (gate, _rx, _) = create_gate(KillSwitchState::Active, 300, false);
        let wallet = Some(Uuid::new_v4());

        gate.notify(NotificationEvent::TxQueued, wallet, serde_json::json!({}))
            .await;
        gate.stop().await;
        assert_eq!(
            gate.notify(NotificationEvent::TxQueued, wallet, serde_json::json!({}))
                .await,
            NotifyOutcome::Stopped
        );

        gate.start();
        assert_eq!(
            gate.notify(NotificationEvent::TxQueued, wallet, serde_json::json!({}))
                .await,
            NotifyOutcome::Dispatched
        );
    }

    #[tokio::test]
    async fn test_total_failure_is_audited() {
        let (gate, mut rx, audit) = create_gate(KillSwitchState::Active, 0, true);
        let wallet_id = Uuid::new_v4();

        gate.notify(NotificationEvent::TxApprovalRequired, Some(wallet_id), serde_json::json!({}))
            .await;
        rx.recv().await.unwrap();

        // The audit row is written right after the failed send.
        let mut entries = Vec::new();
        for _ in 0..50 {
            entries = audit
                .get_entries_by_type(AuditEventType::NotificationTotalFailure)
                .await;
            if !entries.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].severity, AuditSeverity::Critical);
        assert_eq!(entries[0].wallet_id, Some(wallet_id));
    }

    #[tokio::test]
    async fn test_elapsed_cooldowns_are_pruned() {
        let (gate, _rx, _) = create_gate(KillSwitchState::Active, 300, false);
        let start = Utc::now();
        let wallet_a = Some(Uuid::new_v4());
        let wallet_b = Some(Uuid::new_v4());

        assert!(gate.admit((wallet_a, NotificationEvent::TxQueued), start).await);
        assert!(gate.admit((wallet_b, NotificationEvent::TxQueued), start).await);
        assert_eq!(gate.cooldown_entries().await, 2);
        assert!(
            !gate
                .admit((wallet_a, NotificationEvent::TxQueued), start + Duration::seconds(299))
                .await
        );

        // Once the window has passed the stale pairs are dropped.
        let later = start + Duration::seconds(300);
        assert!(gate.admit((wallet_a, NotificationEvent::TxQueued), later).await);
        assert_eq!(gate.cooldown_entries().await, 1);
    }

    #[tokio::test]
    async fn test_oversized_cooldown_saturates() {
        let (gate, _rx, _) = create_gate(KillSwitchState::Active, u64::MAX, false);
        let wallet = Some(Uuid::new_v4());

        assert_eq!(
            gate.notify(NotificationEvent::TxQueued, wallet, serde_json::json!({}))
                .await,
            NotifyOutcome::Dispatched
        );
        assert_eq!(
            gate.notify(NotificationEvent::TxQueued, wallet, serde_json::json!({}))
                .await,
            NotifyOutcome::SuppressedByCooldown
        );
    }
}
