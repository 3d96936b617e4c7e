//! Emergency kill switch for Wallet Guard.
//!
//! The switch is a persisted latch: ACTIVE (normal), SUSPENDED (soft stop)
//! and LOCKED (hard stop). Every transition is a compare-and-set on the
//! stored record, so concurrent operators collapse into one transition.
//!
//! Tripping the switch mutes notifications. It does not stop writes: the
//! transition itself is audited and published on the event bus, and every
//! other component keeps writing its own rows while the switch is tripped.
//!
//! Activation also halts the fleet once, at the moment of the transition:
//! live sessions are revoked, in-flight transactions (PENDING, QUEUED and
//! EXECUTING) are cancelled and ACTIVE wallets are suspended. Transactions
//! awaiting a human decision are left to the approval workflow. Each step is
//! best-effort and logged on failure.

use crate::notifications::{NotificationEvent, NotificationGate};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use wg_core::db::{
    DbError, KillSwitchRepository, SessionRepository, TransactionRepository, WalletRepository,
};
use wg_core::{
    time, EventBus, KillSwitchRecord, KillSwitchState, LifecycleEvent, TransactionStatus,
    TransactionUpdate,
};
use wg_observability::{
    AuditEntry, AuditError, AuditEventType, AuditSeverity, AuditSink, ControlPlaneMetrics,
};

/// Lower bound of the recovery cooldown.
pub const MIN_RECOVERY_COOLDOWN_SECS: u64 = 600;
/// Upper bound of the recovery cooldown.
pub const MAX_RECOVERY_COOLDOWN_SECS: u64 = 86_400;
/// Error written to cancelled transactions and reason written to suspended
/// wallets.
pub const KILL_SWITCH_REASON: &str = "Kill switch activated";

/// Statuses cancelled on activation.
const IN_FLIGHT: [TransactionStatus; 3] = [
    TransactionStatus::Pending,
    TransactionStatus::Queued,
    TransactionStatus::Executing,
];

/// Errors that can occur when operating the kill switch.
#[derive(Error, Debug)]
pub enum KillSwitchError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    /// Recovery was requested while the switch is ACTIVE.
    #[error("Kill switch is not tripped")]
    NotTripped,

    /// The record changed between read and write.
    #[error("Kill switch state changed concurrently (now {0})")]
    Conflict(KillSwitchState),
}

/// Kill switch settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KillSwitchConfig {
    /// Minimum time between the last transition and a successful recovery.
    pub recovery_cooldown_secs: u64,
    /// Premature recovery attempts tolerated while SUSPENDED before the
    /// switch escalates to LOCKED.
    pub max_recovery_attempts: u32,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            recovery_cooldown_secs: 1800,
            max_recovery_attempts: 3,
        }
    }
}

impl KillSwitchConfig {
    /// The cooldown actually applied, clamped to its bounds.
    pub fn effective_cooldown(&self) -> Duration {
        let secs = self
            .recovery_cooldown_secs
            .clamp(MIN_RECOVERY_COOLDOWN_SECS, MAX_RECOVERY_COOLDOWN_SECS);
        time::saturating_seconds(secs)
    }

    /// The attempt limit actually applied.
    pub fn effective_max_attempts(&self) -> u32 {
        self.max_recovery_attempts.clamp(1, 10)
    }
}

/// Result of an activation or escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeResult {
    pub success: bool,
    /// State after the call.
    pub state: KillSwitchState,
    pub error: Option<String>,
}

impl CascadeResult {
    fn applied(state: KillSwitchState) -> Self {
        Self {
            success: true,
            state,
            error: None,
        }
    }

    fn refused(state: KillSwitchState, error: impl Into<String>) -> Self {
        Self {
            success: false,
            state,
            error: Some(error.into()),
        }
    }
}

/// Result of a recovery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The switch is ACTIVE again.
    Recovered,
    /// Too early; the attempt was counted.
    CooldownActive { remaining_secs: u64, attempts: u32 },
    /// Too many premature attempts; the switch is now LOCKED.
    Escalated,
}

/// What an activation halted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetHalt {
    pub sessions_revoked: u64,
    pub transactions_cancelled: u64,
    pub wallets_suspended: u64,
}

/// Stores the kill switch reads and writes.
#[derive(Clone)]
pub struct KillSwitchStores {
    pub switch: Arc<dyn KillSwitchRepository>,
    pub sessions: Arc<dyn SessionRepository>,
    pub wallets: Arc<dyn WalletRepository>,
    pub transactions: Arc<dyn TransactionRepository>,
}

/// Current status of the kill switch.
#[derive(Debug, Clone, Serialize)]
pub struct KillSwitchStatus {
    pub state: KillSwitchState,
    pub activated_at: Option<DateTime<Utc>>,
    pub activated_by: Option<String>,
    pub failed_recovery_attempts: u32,
    /// Seconds until recovery is possible; zero when ACTIVE or due.
    pub cooldown_remaining_secs: u64,
}

/// The kill switch service.
pub struct KillSwitchService {
    repo: Arc<dyn KillSwitchRepository>,
    sessions: Arc<dyn SessionRepository>,
    wallets: Arc<dyn WalletRepository>,
    transactions: Arc<dyn TransactionRepository>,
    events: Arc<EventBus>,
    audit: Arc<dyn AuditSink>,
    notifications: Arc<NotificationGate>,
    metrics: ControlPlaneMetrics,
    config: KillSwitchConfig,
}

impl KillSwitchService {
    pub fn new(
        stores: KillSwitchStores,
        events: Arc<EventBus>,
        audit: Arc<dyn AuditSink>,
        notifications: Arc<NotificationGate>,
        config: KillSwitchConfig,
    ) -> Self {
        Self {
            repo: stores.switch,
            sessions: stores.sessions,
            wallets: stores.wallets,
            transactions: stores.transactions,
            events,
            audit,
            notifications,
            metrics: ControlPlaneMetrics::new(),
            config,
        }
    }

    /// Current state, read from the store.
    pub async fn state(&self) -> Result<KillSwitchState, KillSwitchError> {
        Ok(self.repo.load().await?.state)
    }

    /// Current status, read from the store.
    pub async fn status(&self) -> Result<KillSwitchStatus, KillSwitchError> {
        let record = self.repo.load().await?;
        let cooldown_remaining_secs = if record.state == KillSwitchState::Active {
            0
        } else {
            self.cooldown_remaining(&record, Utc::now())
        };

        Ok(KillSwitchStatus {
            state: record.state,
            activated_at: record.activated_at,
            activated_by: record.activated_by,
            failed_recovery_attempts: record.failed_recovery_attempts,
            cooldown_remaining_secs,
        })
    }

    /// ACTIVE -> SUSPENDED. Never fails: a refused or failed activation is
    /// reported with `success = false` and the unchanged state.
    pub async fn activate_with_cascade(&self, actor: &str) -> CascadeResult {
        let now = Utc::now();
        let record = KillSwitchRecord {
            state: KillSwitchState::Suspended,
            activated_at: Some(now),
            activated_by: Some(actor.to_string()),
            transitioned_at: Some(now),
            failed_recovery_attempts: 0,
        };

        match self.repo.compare_and_set(KillSwitchState::Active, &record).await {
            Ok(true) => {}
            Ok(false) => {
                let current = self.current_state_or(KillSwitchState::Active).await;
                warn!(actor = %actor, state = %current, "Kill switch activation refused");
                return CascadeResult::refused(
                    current,
                    format!("Kill switch is already {}", current),
                );
            }
            Err(e) => {
                error!(actor = %actor, error = %e, "Kill switch activation failed");
                let current = self.current_state_or(KillSwitchState::Active).await;
                return CascadeResult::refused(current, e.to_string());
            }
        }

        error!(
            activated_by = %actor,
            activated_at = %now,
            "KILL SWITCH ACTIVATED - notifications muted"
        );
        let halt = self.halt_fleet(now).await;
        self.cascade(
            KillSwitchState::Active,
            KillSwitchState::Suspended,
            actor,
            now,
            AuditEventType::KillSwitchActivated,
            NotificationEvent::KillSwitchActivated,
            Some(halt),
        )
        .await;

        CascadeResult::applied(KillSwitchState::Suspended)
    }

    /// SUSPENDED -> LOCKED.
    pub async fn escalate_with_cascade(&self, actor: &str) -> CascadeResult {
        let current = match self.repo.load().await {
            Ok(record) => record,
            Err(e) => {
                error!(actor = %actor, error = %e, "Kill switch escalation failed");
                return CascadeResult::refused(KillSwitchState::Suspended, e.to_string());
            }
        };
        if current.state != KillSwitchState::Suspended {
            return CascadeResult::refused(
                current.state,
                format!("Cannot escalate from {} (must be SUSPENDED)", current.state),
            );
        }

        match self.lock(current, actor).await {
            Ok(true) => CascadeResult::applied(KillSwitchState::Locked),
            Ok(false) => {
                let state = self.current_state_or(KillSwitchState::Suspended).await;
                CascadeResult::refused(
                    state,
                    format!("Cannot escalate from {} (must be SUSPENDED)", state),
                )
            }
            Err(e) => {
                error!(actor = %actor, error = %e, "Kill switch escalation failed");
                CascadeResult::refused(KillSwitchState::Suspended, e.to_string())
            }
        }
    }

    /// Returns the switch to ACTIVE once the cooldown since the last
    /// transition has elapsed.
    ///
    /// A premature attempt is counted. While SUSPENDED, reaching the attempt
    /// limit escalates to LOCKED.
    pub async fn recover(&self, actor: &str) -> Result<RecoveryOutcome, KillSwitchError> {
        let now = Utc::now();
        let record = self.repo.load().await?;
        if record.state == KillSwitchState::Active {
            return Err(KillSwitchError::NotTripped);
        }

        let remaining_secs = self.cooldown_remaining(&record, now);
        if remaining_secs > 0 {
            let attempts = record.failed_recovery_attempts + 1;
            warn!(
                actor = %actor,
                attempts,
                remaining_secs,
                "Premature kill switch recovery attempt"
            );

            if record.state == KillSwitchState::Suspended
                && attempts >= self.config.effective_max_attempts()
            {
                return if self.lock(record, actor).await? {
                    Ok(RecoveryOutcome::Escalated)
                } else {
                    Err(KillSwitchError::Conflict(self.repo.load().await?.state))
                };
            }

            let updated = KillSwitchRecord {
                failed_recovery_attempts: attempts,
                ..record.clone()
            };
            if !self.repo.compare_and_set(record.state, &updated).await? {
                return Err(KillSwitchError::Conflict(self.repo.load().await?.state));
            }
            return Ok(RecoveryOutcome::CooldownActive {
                remaining_secs,
                attempts,
            });
        }

        let recovered = KillSwitchRecord {
            transitioned_at: Some(now),
            ..KillSwitchRecord::active()
        };
        if !self.repo.compare_and_set(record.state, &recovered).await? {
            return Err(KillSwitchError::Conflict(self.repo.load().await?.state));
        }

        info!(actor = %actor, from = %record.state, "Kill switch recovered");
        self.cascade(
            record.state,
            KillSwitchState::Active,
            actor,
            now,
            AuditEventType::KillSwitchRecovered,
            NotificationEvent::KillSwitchRecovered,
            None,
        )
        .await;

        Ok(RecoveryOutcome::Recovered)
    }

    /// Writes LOCKED over a SUSPENDED record and runs the cascade.
    async fn lock(&self, current: KillSwitchRecord, actor: &str) -> Result<bool, KillSwitchError> {
        let now = Utc::now();
        let locked = KillSwitchRecord {
            state: KillSwitchState::Locked,
            transitioned_at: Some(now),
            failed_recovery_attempts: 0,
            ..current
        };
        if !self
            .repo
            .compare_and_set(KillSwitchState::Suspended, &locked)
            .await?
        {
            return Ok(false);
        }

        error!(actor = %actor, "KILL SWITCH LOCKED");
        self.cascade(
            KillSwitchState::Suspended,
            KillSwitchState::Locked,
            actor,
            now,
            AuditEventType::KillSwitchEscalated,
            NotificationEvent::KillSwitchEscalated,
            None,
        )
        .await;
        Ok(true)
    }

    fn cooldown_remaining(&self, record: &KillSwitchRecord, now: DateTime<Utc>) -> u64 {
        let Some(since) = record.transitioned_at.or(record.activated_at) else {
            return 0;
        };
        let ready_at = since + self.config.effective_cooldown();
        if now >= ready_at {
            0
        } else {
            // Round up so that "0 remaining" always means ready.
            let millis = (ready_at - now).num_milliseconds().max(0) as u64;
            millis.div_ceil(1000)
        }
    }

    async fn current_state_or(&self, fallback: KillSwitchState) -> KillSwitchState {
        self.repo.load().await.map(|r| r.state).unwrap_or(fallback)
    }

    /// Revokes sessions, cancels in-flight transactions and suspends
    /// wallets. A failed step is logged and the next one still runs.
    async fn halt_fleet(&self, at: DateTime<Utc>) -> FleetHalt {
        let mut halt = FleetHalt::default();

        match self.sessions.revoke_all(at).await {
            Ok(revoked) => halt.sessions_revoked = revoked,
            Err(e) => error!(error = %e, "Kill switch failed to revoke sessions"),
        }

        match self.transactions.list_by_status(&IN_FLIGHT).await {
            Ok(in_flight) => {
                let update = TransactionUpdate::to_status(TransactionStatus::Cancelled)
                    .release_reservation()
                    .with_error(KILL_SWITCH_REASON);
                for tx in in_flight {
                    match self
                        .transactions
                        .update_if_status(tx.id, &IN_FLIGHT, &update)
                        .await
                    {
                        Ok(true) => halt.transactions_cancelled += 1,
                        Ok(false) => {}
                        Err(e) => error!(
                            tx_id = %tx.id,
                            error = %e,
                            "Kill switch failed to cancel transaction"
                        ),
                    }
                }
            }
            Err(e) => error!(error = %e, "Kill switch failed to list in-flight transactions"),
        }

        match self.wallets.suspend_all_active(at, KILL_SWITCH_REASON).await {
            Ok(suspended) => halt.wallets_suspended = suspended,
            Err(e) => error!(error = %e, "Kill switch failed to suspend wallets"),
        }

        info!(
            sessions_revoked = halt.sessions_revoked,
            transactions_cancelled = halt.transactions_cancelled,
            wallets_suspended = halt.wallets_suspended,
            "Kill switch halted the fleet"
        );
        halt
    }

    /// Side effects of a transition. Failures are logged; the transition
    /// itself has already been stored.
    #[allow(clippy::too_many_arguments)]
    async fn cascade(
        &self,
        from: KillSwitchState,
        to: KillSwitchState,
        actor: &str,
        at: DateTime<Utc>,
        audit_type: AuditEventType,
        notification: NotificationEvent,
        halt: Option<FleetHalt>,
    ) {
        self.metrics
            .record_kill_switch_transition(from.as_db_str(), to.as_db_str());

        let action = match to {
            KillSwitchState::Suspended => "kill_switch_activated",
            KillSwitchState::Locked => "kill_switch_escalated",
            KillSwitchState::Active => "kill_switch_recovered",
        };
        let mut details = serde_json::json!({
            "action": action,
            "activatedBy": actor,
            "from": from,
            "to": to,
        });
        if let Some(halt) = halt {
            details["halted"] = serde_json::json!(halt);
        }
        let entry = AuditEntry::new(audit_type, actor)
            .severity(AuditSeverity::Critical)
            .details(details);
        if let Err(e) = self.audit.append(entry).await {
            error!(error = %e, "Failed to audit kill switch transition");
        }

        let event = LifecycleEvent::KillSwitchStateChanged {
            from,
            to,
            actor: actor.to_string(),
            at,
        };
        if let Err(e) = self.events.publish(event).await {
            error!(error = %e, "Failed to publish kill switch transition");
        }

        self.notifications
            .notify(
                notification,
                None,
                serde_json::json!({"from": from, "to": to, "actor": actor}),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::{LogNotifier, NotifyOutcome};
    use async_trait::async_trait;
    use uuid::Uuid;
    use wg_core::db::memory::{
        InMemoryKillSwitchRepository, InMemorySessionRepository, InMemoryTransactionRepository,
        InMemoryWalletRepository,
    };
    use wg_core::{Amount, Session, Transaction, TransactionRequest, Wallet, WalletStatus};
    use wg_observability::AuditLog;

    struct Harness {
        service: KillSwitchService,
        repo: InMemoryKillSwitchRepository,
        sessions: InMemorySessionRepository,
        wallets: InMemoryWalletRepository,
        transactions: InMemoryTransactionRepository,
        events: Arc<EventBus>,
        audit: Arc<AuditLog>,
        gate: Arc<NotificationGate>,
    }

    /// Session store whose writes always fail.
    struct BrokenSessions;

    #[async_trait]
    impl SessionRepository for BrokenSessions {
        async fn create(&self, _session: &Session) -> Result<Session, DbError> {
            Err(DbError::Query("database is locked".to_string()))
        }

        async fn get(&self, _id: Uuid) -> Result<Option<Session>, DbError> {
            Ok(None)
        }

        async fn list_live(&self, _now: DateTime<Utc>) -> Result<Vec<Session>, DbError> {
            Ok(Vec::new())
        }

        async fn revoke_if_live(&self, _id: Uuid, _at: DateTime<Utc>) -> Result<bool, DbError> {
            Err(DbError::Query("database is locked".to_string()))
        }

        async fn revoke_all(&self, _at: DateTime<Utc>) -> Result<u64, DbError> {
            Err(DbError::Query("database is locked".to_string()))
        }
    }

    fn create_service(record: KillSwitchRecord) -> Harness {
        create_service_with(record, None)
    }

    fn create_service_with(
        record: KillSwitchRecord,
        broken_sessions: Option<Arc<dyn SessionRepository>>,
    ) -> Harness {
        let repo = InMemoryKillSwitchRepository::with_record(record);
        let sessions = InMemorySessionRepository::new();
        let wallets = InMemoryWalletRepository::new();
        let transactions = InMemoryTransactionRepository::new();
        let events = Arc::new(EventBus::new(64));
        let audit = Arc::new(AuditLog::without_tracing(100));
        let gate = Arc::new(NotificationGate::new(
            Arc::new(LogNotifier::new("log")),
            Arc::new(repo.clone()),
            audit.clone(),
            0,
        ));
        let stores = KillSwitchStores {
            switch: Arc::new(repo.clone()),
            sessions: broken_sessions.unwrap_or_else(|| Arc::new(sessions.clone())),
            wallets: Arc::new(wallets.clone()),
            transactions: Arc::new(transactions.clone()),
        };
        let service = KillSwitchService::new(
            stores,
            events.clone(),
            audit.clone(),
            gate.clone(),
            KillSwitchConfig::default(),
        );
        Harness {
            service,
            repo,
            sessions,
            wallets,
            transactions,
            events,
            audit,
            gate,
        }
    }

    fn tripped(state: KillSwitchState, minutes_ago: i64, attempts: u32) -> KillSwitchRecord {
        let at = Utc::now() - Duration::minutes(minutes_ago);
        KillSwitchRecord {
            state,
            activated_at: Some(at),
            activated_by: Some("ops".to_string()),
            transitioned_at: Some(at),
            failed_recovery_attempts: attempts,
        }
    }

    #[tokio::test]
    async fn test_activate_once() {
        let h = create_service(KillSwitchRecord::active());

        let result = h.service.activate_with_cascade("ops").await;
        assert!(result.success);
        assert_eq!(result.state, KillSwitchState::Suspended);

        let again = h.service.activate_with_cascade("someone-else").await;
        assert!(!again.success);
        assert_eq!(again.state, KillSwitchState::Suspended);
        assert_eq!(again.error.as_deref(), Some("Kill switch is already SUSPENDED"));

        // Side effects happened exactly once.
        let entries = h.audit.get_entries_by_type(AuditEventType::KillSwitchActivated).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].severity, AuditSeverity::Critical);
        assert_eq!(entries[0].details["activatedBy"], "ops");
        assert_eq!(h.events.get_history(None).await.len(), 1);

        let record = h.repo.load().await.unwrap();
        assert_eq!(record.activated_by.as_deref(), Some("ops"));
    }

    #[tokio::test]
    async fn test_own_notification_is_muted() {
        let h = create_service(KillSwitchRecord::active());
        h.service.activate_with_cascade("ops").await;

        assert_eq!(h.gate.dispatched_count(), 0);
        assert_eq!(h.gate.suppressed_count(), 1);
        assert_eq!(
            h.gate
                .notify(NotificationEvent::TxQueued, None, serde_json::json!({}))
                .await,
            NotifyOutcome::SuppressedByKillSwitch
        );
    }

    #[tokio::test]
    async fn test_escalate_requires_suspended() {
        let h = create_service(KillSwitchRecord::active());
        let result = h.service.escalate_with_cascade("ops").await;
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Cannot escalate from ACTIVE (must be SUSPENDED)")
        );

        h.service.activate_with_cascade("ops").await;
        let result = h.service.escalate_with_cascade("ops").await;
        assert!(result.success);
        assert_eq!(h.service.state().await.unwrap(), KillSwitchState::Locked);
    }

    #[tokio::test]
    async fn test_recover_after_cooldown() {
        let h = create_service(tripped(KillSwitchState::Suspended, 45, 1));

        assert_eq!(h.service.recover("ops").await.unwrap(), RecoveryOutcome::Recovered);

        let status = h.service.status().await.unwrap();
        assert_eq!(status.state, KillSwitchState::Active);
        assert!(status.activated_by.is_none());
        assert_eq!(status.failed_recovery_attempts, 0);

        // The recovery notice itself goes out.
        assert_eq!(h.gate.dispatched_count(), 1);
        assert!(matches!(
            h.service.recover("ops").await,
            Err(KillSwitchError::NotTripped)
        ));
    }

    #[tokio::test]
    async fn test_premature_recovery_counts_then_escalates() {
        let h = create_service(tripped(KillSwitchState::Suspended, 1, 0));

        match h.service.recover("ops").await.unwrap() {
            RecoveryOutcome::CooldownActive {
                remaining_secs,
                attempts,
            } => {
                assert_eq!(attempts, 1);
                assert!(remaining_secs > 1700 && remaining_secs <= 1740);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(matches!(
            h.service.recover("ops").await.unwrap(),
            RecoveryOutcome::CooldownActive { attempts: 2, .. }
        ));
        assert_eq!(h.service.recover("ops").await.unwrap(), RecoveryOutcome::Escalated);

        let status = h.service.status().await.unwrap();
        assert_eq!(status.state, KillSwitchState::Locked);
        assert_eq!(status.failed_recovery_attempts, 0);
        assert_eq!(
            h.audit
                .get_entries_by_type(AuditEventType::KillSwitchEscalated)
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_locked_recovery_never_escalates_further() {
        let h = create_service(tripped(KillSwitchState::Locked, 1, 9));
        assert!(matches!(
            h.service.recover("ops").await.unwrap(),
            RecoveryOutcome::CooldownActive { attempts: 10, .. }
        ));
        assert_eq!(h.service.state().await.unwrap(), KillSwitchState::Locked);
    }

    async fn seed_transaction(h: &Harness, status: TransactionStatus) -> Transaction {
        let mut tx = Transaction::pending(
            Uuid::new_v4(),
            &TransactionRequest::transfer("0xdest", 500u64),
        );
        tx.status = status;
        tx.reserved_amount = Some(Amount::from(500u64));
        h.transactions.create(&tx).await.unwrap()
    }

    #[tokio::test]
    async fn test_activation_halts_fleet() {
        let h = create_service(KillSwitchRecord::active());
        let now = Utc::now();

        let active = h
            .wallets
            .create(&Wallet::new("ethereum", "ethereum-mainnet", "mainnet"))
            .await
            .unwrap();
        let mut terminated = Wallet::new("solana", "solana-mainnet", "mainnet");
        terminated.status = WalletStatus::Terminated;
        h.wallets.create(&terminated).await.unwrap();
        let session = h
            .sessions
            .create(&Session::new(active.id, now + Duration::hours(1)))
            .await
            .unwrap();

        let pending = seed_transaction(&h, TransactionStatus::Pending).await;
        let queued = seed_transaction(&h, TransactionStatus::Queued).await;
        let executing = seed_transaction(&h, TransactionStatus::Executing).await;
        let held = seed_transaction(&h, TransactionStatus::PendingApproval).await;
        let confirmed = seed_transaction(&h, TransactionStatus::Confirmed).await;

        assert!(h.service.activate_with_cascade("ops").await.success);

        for tx in [&pending, &queued, &executing] {
            let stored = h.transactions.get(tx.id).await.unwrap().unwrap();
            assert_eq!(stored.status, TransactionStatus::Cancelled);
            assert_eq!(stored.error.as_deref(), Some(KILL_SWITCH_REASON));
            assert!(stored.reserved_amount.is_none());
        }
        let stored = h.transactions.get(held.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::PendingApproval);
        assert_eq!(stored.reserved_amount, Some(Amount::from(500u64)));
        let stored = h.transactions.get(confirmed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Confirmed);

        let stored = h.wallets.get(active.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WalletStatus::Suspended);
        assert_eq!(stored.suspension_reason.as_deref(), Some(KILL_SWITCH_REASON));
        let stored = h.wallets.get(terminated.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WalletStatus::Terminated);

        let stored = h.sessions.get(session.id).await.unwrap().unwrap();
        assert!(stored.revoked_at.is_some());

        let entries = h.audit.get_entries_by_type(AuditEventType::KillSwitchActivated).await;
        assert_eq!(
            entries[0].details["halted"],
            serde_json::json!({
                "sessionsRevoked": 1,
                "transactionsCancelled": 3,
                "walletsSuspended": 1,
            })
        );
    }

    #[tokio::test]
    async fn test_refused_activation_halts_nothing() {
        let h = create_service(tripped(KillSwitchState::Suspended, 5, 0));
        let queued = seed_transaction(&h, TransactionStatus::Queued).await;

        assert!(!h.service.activate_with_cascade("ops").await.success);
        let stored = h.transactions.get(queued.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Queued);
    }

    #[tokio::test]
    async fn test_failed_halt_step_does_not_stop_the_rest() {
        let broken: Arc<dyn SessionRepository> = Arc::new(BrokenSessions);
        let h = create_service_with(KillSwitchRecord::active(), Some(broken));
        let wallet = h
            .wallets
            .create(&Wallet::new("ethereum", "ethereum-mainnet", "mainnet"))
            .await
            .unwrap();
        let queued = seed_transaction(&h, TransactionStatus::Queued).await;

        let result = h.service.activate_with_cascade("ops").await;
        assert!(result.success);
        assert_eq!(result.state, KillSwitchState::Suspended);

        let stored = h.transactions.get(queued.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Cancelled);
        let stored = h.wallets.get(wallet.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WalletStatus::Suspended);

        let entries = h.audit.get_entries_by_type(AuditEventType::KillSwitchActivated).await;
        assert_eq!(entries[0].details["halted"]["sessionsRevoked"], 0);
        assert_eq!(entries[0].details["halted"]["transactionsCancelled"], 1);
    }

    #[tokio::test]
    async fn test_recovery_does_not_reactivate_wallets() {
        let h = create_service(KillSwitchRecord::active());
        let wallet = h
            .wallets
            .create(&Wallet::new("ethereum", "ethereum-mainnet", "mainnet"))
            .await
            .unwrap();
        h.service.activate_with_cascade("ops").await;
        h.repo
            .compare_and_set(
                KillSwitchState::Suspended,
                &tripped(KillSwitchState::Suspended, 45, 0),
            )
            .await
            .unwrap();

        assert_eq!(h.service.recover("ops").await.unwrap(), RecoveryOutcome::Recovered);
        let stored = h.wallets.get(wallet.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WalletStatus::Suspended);
    }

    #[test]
    fn test_cooldown_clamped() {
        let short = KillSwitchConfig {
            recovery_cooldown_secs: 10,
            max_recovery_attempts: 0,
        };
        assert_eq!(short.effective_cooldown(), Duration::seconds(600));
        assert_eq!(short.effective_max_attempts(), 1);

        let long = KillSwitchConfig {
            recovery_cooldown_secs: 1_000_000,
            max_recovery_attempts: 50,
        };
        assert_eq!(long.effective_cooldown(), Duration::seconds(86_400));
        assert_eq!(long.effective_max_attempts(), 10);
    }
}
