//! Control plane integration tests.
//!
//! These tests wire the delay queue, approval workflow, autostop engine,
//! kill switch and notification gate over shared in-memory stores:
//! - Autostop counts consecutive failures, resets on success and re-arms
//! - A tripped kill switch mutes notifications but not events or audit rows
//! - Activation halts sessions, in-flight transactions and wallets, but not
//!   transactions awaiting approval
//! - Suspending an already suspended wallet has no side effects

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use wg_core::db::memory::{
    InMemoryApprovalRepository, InMemoryKillSwitchRepository, InMemorySessionRepository,
    InMemoryTransactionRepository, InMemoryWalletRepository,
};
use wg_core::db::{SessionRepository, TransactionRepository, WalletRepository};
use wg_core::{
    EventBus, KillSwitchState, LifecycleEvent, Session, Transaction, TransactionRequest,
    TransactionStatus, Wallet, WalletStatus,
};
use wg_observability::{AuditEventType, AuditLog};
use wg_policy::autostop::AutoStopConfigUpdate;
use wg_policy::notifications::{Notification, NotificationError, NotifyOutcome};
use wg_policy::{
    ApprovalWorkflow, AutoStopConfig, AutoStopRule, AutoStopService, DelayQueue, DelayQueueError,
    KillSwitchConfig, KillSwitchService, KillSwitchStores, NotificationEvent, NotificationGate,
    Notifier, KILL_SWITCH_REASON,
};

/// Notifier that remembers what it was asked to send.
#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<NotificationEvent>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        self.sent.lock().await.push(notification.event_type);
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

struct ControlPlane {
    wallets: InMemoryWalletRepository,
    sessions: InMemorySessionRepository,
    transactions: InMemoryTransactionRepository,
    events: Arc<EventBus>,
    audit: Arc<AuditLog>,
    notifier: Arc<RecordingNotifier>,
    gate: Arc<NotificationGate>,
    kill_switch: Arc<KillSwitchService>,
    autostop: Arc<AutoStopService>,
    delay_queue: DelayQueue,
    approvals: ApprovalWorkflow,
}

fn control_plane() -> ControlPlane {
    let wallets = InMemoryWalletRepository::new();
    let transactions = InMemoryTransactionRepository::new();
    let kill_switch_repo = Arc::new(InMemoryKillSwitchRepository::new());
    let events = Arc::new(EventBus::new(256));
    let audit = Arc::new(AuditLog::without_tracing(1000));
    let notifier = Arc::new(RecordingNotifier::default());
    let gate = Arc::new(NotificationGate::new(
        notifier.clone(),
        kill_switch_repo.clone(),
        audit.clone(),
        0,
    ));
    let sessions = InMemorySessionRepository::new();
    let stores = KillSwitchStores {
        switch: kill_switch_repo,
        sessions: Arc::new(sessions.clone()),
        wallets: Arc::new(wallets.clone()),
        transactions: Arc::new(transactions.clone()),
    };
    let kill_switch = Arc::new(KillSwitchService::new(
        stores,
        events.clone(),
        audit.clone(),
        gate.clone(),
        KillSwitchConfig::default(),
    ));
    let autostop = Arc::new(AutoStopService::new(
        Arc::new(wallets.clone()),
        Arc::new(sessions.clone()),
        events.clone(),
        audit.clone(),
        gate.clone(),
        kill_switch.clone(),
        AutoStopConfig::default(),
    ));
    let delay_queue = DelayQueue::new(
        Arc::new(transactions.clone()),
        events.clone(),
        audit.clone(),
        gate.clone(),
    );
    let approvals = ApprovalWorkflow::new(
        Arc::new(transactions.clone()),
        Arc::new(InMemoryApprovalRepository::new()),
        events.clone(),
        audit.clone(),
        gate.clone(),
        3600,
    );

    ControlPlane {
        wallets,
        sessions,
        transactions,
        events,
        audit,
        notifier,
        gate,
        kill_switch,
        autostop,
        delay_queue,
        approvals,
    }
}

impl ControlPlane {
    async fn wallet(&self) -> Wallet {
        self.wallets
            .create(&Wallet::new("ethereum", "ethereum-mainnet", "mainnet"))
            .await
            .unwrap()
    }

    async fn pending(&self, wallet_id: Uuid) -> Transaction {
        let tx = Transaction::pending(wallet_id, &TransactionRequest::transfer("0xdest", 1_000u64));
        self.transactions.create(&tx).await.unwrap()
    }

    async fn status(&self, wallet_id: Uuid) -> WalletStatus {
        self.wallets.get(wallet_id).await.unwrap().unwrap().status
    }

    /// Waits for spawned notification deliveries to land.
    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn failed(wallet_id: Uuid) -> LifecycleEvent {
    LifecycleEvent::TransactionFailed {
        wallet_id,
        tx_id: Uuid::new_v4(),
        error: "execution reverted".to_string(),
        at: Utc::now(),
    }
}

fn completed(wallet_id: Uuid) -> LifecycleEvent {
    LifecycleEvent::TransactionCompleted {
        wallet_id,
        tx_id: Uuid::new_v4(),
        at: Utc::now(),
    }
}

// =============================================================================
// Autostop Tests
// =============================================================================

#[tokio::test]
async fn test_autostop_resets_on_success() {
    let cp = control_plane();
    let wallet = cp.wallet().await;

    for _ in 0..4 {
        cp.autostop.handle_event(&failed(wallet.id)).await.unwrap();
    }
    cp.autostop.handle_event(&completed(wallet.id)).await.unwrap();
    for _ in 0..4 {
        cp.autostop.handle_event(&failed(wallet.id)).await.unwrap();
    }
    assert_eq!(cp.status(wallet.id).await, WalletStatus::Active);

    cp.autostop.handle_event(&failed(wallet.id)).await.unwrap();
    assert_eq!(cp.status(wallet.id).await, WalletStatus::Suspended);
}

#[tokio::test]
async fn test_autostop_rearms_after_reactivation() {
    let cp = control_plane();
    let wallet = cp.wallet().await;

    for _ in 0..5 {
        cp.autostop.handle_event(&failed(wallet.id)).await.unwrap();
    }
    let suspended = cp.wallets.get(wallet.id).await.unwrap().unwrap();
    assert_eq!(suspended.status, WalletStatus::Suspended);
    assert_eq!(
        suspended.suspension_reason.as_deref(),
        Some(AutoStopRule::ConsecutiveFailures.as_str())
    );

    assert!(cp.wallets.reactivate(wallet.id).await.unwrap());

    // The counter started over at suspension: four more failures are not enough.
    for _ in 0..4 {
        cp.autostop.handle_event(&failed(wallet.id)).await.unwrap();
    }
    assert_eq!(cp.status(wallet.id).await, WalletStatus::Active);

    cp.autostop.handle_event(&failed(wallet.id)).await.unwrap();
    assert_eq!(cp.status(wallet.id).await, WalletStatus::Suspended);
    assert_eq!(
        cp.audit
            .get_entries_by_type(AuditEventType::AutoStopTriggered)
            .await
            .len(),
        2
    );
}

#[tokio::test]
async fn test_idempotent_resuspension() {
    let cp = control_plane();
    let wallet = cp.wallet().await;

    assert!(cp
        .autostop
        .suspend_wallet(wallet.id, AutoStopRule::UnusualActivity, "burst")
        .await
        .unwrap());
    cp.settle().await;
    let rows = cp.audit.len().await;
    let dispatched = cp.gate.dispatched_count();
    let sent = cp.notifier.sent.lock().await.len();
    assert_eq!(sent, 1);

    assert!(!cp
        .autostop
        .suspend_wallet(wallet.id, AutoStopRule::ConsecutiveFailures, "again")
        .await
        .unwrap());
    cp.settle().await;

    assert_eq!(cp.audit.len().await, rows);
    assert_eq!(cp.gate.dispatched_count(), dispatched);
    assert_eq!(cp.notifier.sent.lock().await.len(), sent);
    // The first suspension's reason is kept.
    let stored = cp.wallets.get(wallet.id).await.unwrap().unwrap();
    assert_eq!(
        stored.suspension_reason.as_deref(),
        Some(AutoStopRule::UnusualActivity.as_str())
    );
}

#[tokio::test]
async fn test_autostop_dispatcher_suspends_from_bus() {
    let cp = control_plane();
    let wallet = cp.wallet().await;
    cp.autostop
        .update_config(AutoStopConfigUpdate {
            consecutive_failures_threshold: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    cp.autostop.start().await.unwrap();

    cp.events.publish(failed(wallet.id)).await.unwrap();
    cp.events.publish(failed(wallet.id)).await.unwrap();

    let mut suspended = false;
    for _ in 0..50 {
        if cp.status(wallet.id).await == WalletStatus::Suspended {
            suspended = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cp.autostop.stop().await;
    assert!(suspended);
}

// =============================================================================
// Kill Switch Tests
// =============================================================================

#[tokio::test]
async fn test_kill_switch_mutes_notifications_but_not_writes() {
    let cp = control_plane();
    let wallet = cp.wallet().await;

    let result = cp.kill_switch.activate_with_cascade("security_team").await;
    assert!(result.success);
    assert_eq!(cp.kill_switch.state().await.unwrap(), KillSwitchState::Suspended);
    cp.settle().await;
    let sent_before = cp.notifier.sent.lock().await.len();
    assert_eq!(sent_before, 0);

    for _ in 0..3 {
        let tx = cp.pending(wallet.id).await;
        cp.delay_queue.enqueue(tx.id, 900).await.unwrap();
    }
    cp.settle().await;

    let queued_events = cp
        .events
        .get_wallet_events(wallet.id)
        .await
        .into_iter()
        .filter(|e| matches!(e, LifecycleEvent::TransactionQueued { .. }))
        .count();
    assert_eq!(queued_events, 3);
    assert_eq!(
        cp.audit
            .get_entries_by_type(AuditEventType::TransactionQueued)
            .await
            .len(),
        3
    );
    assert_eq!(cp.notifier.sent.lock().await.len(), 0);
    assert_eq!(cp.gate.dispatched_count(), 0);
    assert!(cp.gate.suppressed_count() >= 3);
}

#[tokio::test]
async fn test_kill_switch_halts_in_flight_work() {
    let cp = control_plane();
    let wallet = cp.wallet().await;
    let session = cp
        .sessions
        .create(&Session::new(wallet.id, Utc::now() + chrono::Duration::hours(1)))
        .await
        .unwrap();
    let delayed = cp.pending(wallet.id).await;
    cp.delay_queue.enqueue(delayed.id, 900).await.unwrap();
    let fresh = cp.pending(wallet.id).await;

    assert!(cp.kill_switch.activate_with_cascade("security_team").await.success);

    for id in [delayed.id, fresh.id] {
        let stored = cp.transactions.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Cancelled);
        assert_eq!(stored.error.as_deref(), Some(KILL_SWITCH_REASON));
    }
    assert_eq!(cp.status(wallet.id).await, WalletStatus::Suspended);
    let stored = cp.sessions.get(session.id).await.unwrap().unwrap();
    assert!(stored.revoked_at.is_some());

    // The cancelled delay is gone from the queue.
    assert!(matches!(
        cp.delay_queue.cancel_delay(delayed.id).await,
        Err(DelayQueueError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_kill_switch_leaves_approvals_pending() {
    let cp = control_plane();
    let wallet = cp.wallet().await;
    let tx = cp.pending(wallet.id).await;
    cp.approvals.request_approval(tx.id, None).await.unwrap();

    assert!(cp.kill_switch.activate_with_cascade("admin").await.success);
    assert_eq!(cp.status(wallet.id).await, WalletStatus::Suspended);

    let stored = cp.transactions.get(tx.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::PendingApproval);
    assert_eq!(cp.approvals.list_pending().await.unwrap().len(), 1);

    // Owners can still decide while notifications are muted.
    assert!(cp.approvals.approve(tx.id, Some("dashboard")).await.unwrap());
    let stored = cp.transactions.get(tx.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::Executing);
}

#[tokio::test]
async fn test_manual_trigger_trips_kill_switch() {
    let cp = control_plane();

    let result = cp.autostop.manual_trigger("operator").await;
    assert!(result.success);
    assert_eq!(result.state, KillSwitchState::Suspended);

    // A second trigger reports the switch is already tripped.
    let again = cp.autostop.manual_trigger("operator").await;
    assert!(!again.success);
    assert!(again.error.unwrap().contains("already SUSPENDED"));

    cp.settle().await;
    assert!(cp.notifier.sent.lock().await.is_empty());
}

#[tokio::test]
async fn test_notifications_flow_while_active() {
    let cp = control_plane();
    let wallet = cp.wallet().await;
    let tx = cp.pending(wallet.id).await;

    cp.delay_queue.enqueue(tx.id, 900).await.unwrap();
    cp.settle().await;

    assert_eq!(
        *cp.notifier.sent.lock().await,
        vec![NotificationEvent::TxQueued]
    );
    assert_eq!(
        cp.gate
            .notify(NotificationEvent::TxQueued, Some(wallet.id), serde_json::json!({}))
            .await,
        NotifyOutcome::Dispatched
    );
}
