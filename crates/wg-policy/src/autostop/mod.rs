//! Autostop engine.
//!
//! Watches wallet lifecycle events and suspends wallets that misbehave:
//!
//! - too many failed transactions in a row;
//! - too much activity inside a sliding window;
//! - sessions idle for longer than the idle timeout are revoked.
//!
//! The service receives events through a named subscriber on the
//! [`EventBus`] and handles them on a single dispatcher task. A periodic
//! idle check runs next to it. Both stop on [`AutoStopService::stop`].

mod rules;

pub use rules::{AutoStopRule, ConsecutiveFailuresRule, IdleTimeoutRule, UnusualActivityRule};

use crate::kill_switch::{CascadeResult, KillSwitchService};
use crate::notifications::{NotificationEvent, NotificationGate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wg_core::db::{DbError, SessionRepository, WalletRepository};
use wg_core::{EventBus, EventBusError, LifecycleEvent};
use wg_observability::{
    AuditEntry, AuditError, AuditEventType, AuditSeverity, AuditSink, ControlPlaneMetrics,
};

/// Name of the autostop subscriber on the event bus.
pub const SUBSCRIBER_NAME: &str = "autostop";

/// Activity string announcing a new session.
pub const SESSION_CREATED: &str = "SESSION_CREATED";

const CHANNEL_CAPACITY: usize = 1024;

/// Errors that can occur in the autostop engine.
#[derive(Error, Debug)]
pub enum AutoStopError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("Invalid autostop configuration: {0}")]
    InvalidConfig(String),

    #[error("Autostop service is already running")]
    AlreadyRunning,
}

/// Autostop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AutoStopConfig {
    pub enabled: bool,
    pub consecutive_failures_threshold: u32,
    pub unusual_activity_threshold: u32,
    pub unusual_activity_window_secs: u64,
    pub idle_timeout_secs: u64,
    pub idle_check_interval_secs: u64,
}

impl Default for AutoStopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            consecutive_failures_threshold: 5,
            unusual_activity_threshold: 20,
            unusual_activity_window_secs: 300,
            idle_timeout_secs: 3600,
            idle_check_interval_secs: 60,
        }
    }
}

impl AutoStopConfig {
    /// Rejects zero thresholds, windows and intervals.
    pub fn validate(&self) -> Result<(), AutoStopError> {
        let checks = [
            ("consecutive_failures_threshold", self.consecutive_failures_threshold as u64),
            ("unusual_activity_threshold", self.unusual_activity_threshold as u64),
            ("unusual_activity_window_secs", self.unusual_activity_window_secs),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("idle_check_interval_secs", self.idle_check_interval_secs),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(AutoStopError::InvalidConfig(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Partial update for [`AutoStopService::update_config`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AutoStopConfigUpdate {
    pub enabled: Option<bool>,
    pub consecutive_failures_threshold: Option<u32>,
    pub unusual_activity_threshold: Option<u32>,
    pub unusual_activity_window_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub idle_check_interval_secs: Option<u64>,
}

/// Snapshot of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct AutoStopStatus {
    pub enabled: bool,
    pub running: bool,
    pub config: AutoStopConfig,
    pub consecutive_failures_tracked_wallets: usize,
    pub unusual_activity_tracked_wallets: usize,
    pub idle_tracked_sessions: usize,
}

struct Detectors {
    failures: ConsecutiveFailuresRule,
    activity: UnusualActivityRule,
    idle: IdleTimeoutRule,
}

impl Detectors {
    fn new(config: &AutoStopConfig) -> Self {
        Self {
            failures: ConsecutiveFailuresRule::new(config.consecutive_failures_threshold),
            activity: UnusualActivityRule::new(
                config.unusual_activity_threshold,
                config.unusual_activity_window_secs,
            ),
            idle: IdleTimeoutRule::new(config.idle_timeout_secs),
        }
    }

    fn reset_wallet(&mut self, rule: AutoStopRule, wallet_id: Uuid) {
        match rule {
            AutoStopRule::ConsecutiveFailures => self.failures.reset_wallet(wallet_id),
            AutoStopRule::UnusualActivity => self.activity.reset_wallet(wallet_id),
            AutoStopRule::IdleTimeout | AutoStopRule::ManualTrigger => {}
        }
    }
}

/// The autostop engine.
pub struct AutoStopService {
    wallets: Arc<dyn WalletRepository>,
    sessions: Arc<dyn SessionRepository>,
    events: Arc<EventBus>,
    audit: Arc<dyn AuditSink>,
    notifications: Arc<NotificationGate>,
    kill_switch: Arc<KillSwitchService>,
    metrics: ControlPlaneMetrics,
    config: RwLock<AutoStopConfig>,
    detectors: Mutex<Detectors>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AutoStopService {
    pub fn new(
        wallets: Arc<dyn WalletRepository>,
        sessions: Arc<dyn SessionRepository>,
        events: Arc<EventBus>,
        audit: Arc<dyn AuditSink>,
        notifications: Arc<NotificationGate>,
        kill_switch: Arc<KillSwitchService>,
        config: AutoStopConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            wallets,
            sessions,
            events,
            audit,
            notifications,
            kill_switch,
            metrics: ControlPlaneMetrics::new(),
            detectors: Mutex::new(Detectors::new(&config)),
            config: RwLock::new(config),
            running: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Subscribes to the event bus and starts the dispatcher and the idle
    /// check. Does nothing when the engine is disabled.
    pub async fn start(self: &Arc<Self>) -> Result<(), AutoStopError> {
        let interval_secs = {
            let config = self.config.read().await;
            if !config.enabled {
                info!("Autostop disabled, not starting");
                return Ok(());
            }
            config.idle_check_interval_secs
        };
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AutoStopError::AlreadyRunning);
        }
        self.shutdown_tx.send_replace(false);

        let rx = self
            .events
            .register_subscriber(SUBSCRIBER_NAME, CHANNEL_CAPACITY)
            .await;
        let dispatcher = self.spawn_dispatcher(rx);
        let idle_check = self.spawn_idle_check(interval_secs);
        self.tasks.lock().await.extend([dispatcher, idle_check]);

        info!(idle_check_interval_secs = interval_secs, "Autostop engine started");
        Ok(())
    }

    /// Stops both tasks and clears all detector state.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        if let Err(e) = self.events.unregister_subscriber(SUBSCRIBER_NAME).await {
            debug!(error = %e, "Autostop subscriber already gone");
        }

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Autostop task ended abnormally");
            }
        }

        let mut detectors = self.detectors.lock().await;
        detectors.failures.clear();
        detectors.activity.clear();
        detectors.idle.clear();
        info!("Autostop engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn spawn_dispatcher(
        self: &Arc<Self>,
        mut rx: mpsc::Receiver<LifecycleEvent>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        let Some(event) = event else {
                            debug!("Autostop channel closed");
                            break;
                        };
                        if let Err(e) = service.handle_event(&event).await {
                            error!(
                                event = event.name(),
                                error = %e,
                                "Autostop failed to handle event"
                            );
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Autostop dispatcher shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_idle_check(self: &Arc<Self>, interval_secs: u64) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut current_secs = interval_secs;
            let mut interval = idle_interval(current_secs);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = service.check_idle_sessions(Utc::now()).await {
                            error!(error = %e, "Idle session check failed");
                        }
                        let configured = service.config.read().await.idle_check_interval_secs;
                        if configured != current_secs {
                            current_secs = configured;
                            interval = idle_interval(current_secs);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Idle session check shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Feeds one event to the detectors and acts on what they report.
    pub async fn handle_event(&self, event: &LifecycleEvent) -> Result<(), AutoStopError> {
        if !self.config.read().await.enabled {
            return Ok(());
        }

        match event {
            LifecycleEvent::TransactionFailed { wallet_id, .. } => {
                let (triggered, count) = {
                    let mut detectors = self.detectors.lock().await;
                    let triggered = detectors.failures.on_failure(*wallet_id);
                    (triggered, detectors.failures.count(*wallet_id))
                };
                if triggered {
                    let reason = format!("{} consecutive transaction failures", count);
                    self.suspend_wallet(*wallet_id, AutoStopRule::ConsecutiveFailures, &reason)
                        .await?;
                }
            }
            LifecycleEvent::TransactionCompleted { wallet_id, .. } => {
                self.detectors.lock().await.failures.on_success(*wallet_id);
            }
            LifecycleEvent::WalletActivity {
                wallet_id,
                session_id,
                activity,
                at,
            } => {
                let triggered = {
                    let mut detectors = self.detectors.lock().await;
                    let triggered = detectors.activity.on_activity(*wallet_id, *at);
                    match session_id {
                        Some(session_id) if activity.as_str() == SESSION_CREATED => {
                            detectors.idle.register_session(*wallet_id, *session_id, *at)
                        }
                        _ => detectors.idle.on_activity(*wallet_id, *at, *session_id),
                    }
                    triggered
                };
                if triggered {
                    let threshold = self.config.read().await.unusual_activity_threshold;
                    let reason = format!("{} activities within the window", threshold);
                    self.suspend_wallet(*wallet_id, AutoStopRule::UnusualActivity, &reason)
                        .await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Suspends an ACTIVE wallet.
    ///
    /// Returns false, with no side effects beyond resetting the rule's state,
    /// when the wallet was not ACTIVE.
    pub async fn suspend_wallet(
        &self,
        wallet_id: Uuid,
        rule: AutoStopRule,
        reason: &str,
    ) -> Result<bool, AutoStopError> {
        let now = Utc::now();
        let suspended = self
            .wallets
            .suspend_if_active(wallet_id, now, rule.as_str())
            .await;
        self.detectors.lock().await.reset_wallet(rule, wallet_id);
        if !suspended? {
            debug!(wallet_id = %wallet_id, rule = %rule, "Wallet not active, suspension skipped");
            return Ok(false);
        }

        warn!(
            wallet_id = %wallet_id,
            rule = %rule,
            reason = %reason,
            "Wallet suspended by autostop"
        );
        self.metrics.record_autostop_trigger(rule.as_str());

        self.audit
            .append(
                AuditEntry::new(AuditEventType::AutoStopTriggered, "autostop")
                    .wallet(wallet_id)
                    .severity(AuditSeverity::Warning)
                    .details(serde_json::json!({
                        "action": "wallet_suspended",
                        "rule": rule,
                        "reason": reason,
                        "walletId": wallet_id,
                    })),
            )
            .await?;
        self.events
            .publish(LifecycleEvent::WalletSuspended {
                wallet_id,
                rule: rule.as_str().to_string(),
                reason: reason.to_string(),
                at: now,
            })
            .await?;
        self.notifications
            .notify(
                NotificationEvent::AutoStopTriggered,
                Some(wallet_id),
                serde_json::json!({"walletId": wallet_id, "rule": rule, "reason": reason}),
            )
            .await;

        Ok(true)
    }

    /// Revokes every tracked session idle at `now` and returns the revoked
    /// (wallet, session) pairs.
    pub async fn check_idle_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, Uuid)>, AutoStopError> {
        let (cutoff, candidates) = {
            let detectors = self.detectors.lock().await;
            let cutoff = detectors.idle.cutoff(now);
            (cutoff, detectors.idle.idle_sessions(cutoff))
        };

        let mut revoked = Vec::new();
        for (wallet_id, session_id) in candidates {
            {
                let mut detectors = self.detectors.lock().await;
                // Activity may have arrived since the scan.
                if !detectors.idle.is_idle(wallet_id, session_id, cutoff) {
                    continue;
                }
                detectors.idle.remove_session(wallet_id, session_id);
            }

            if !self.sessions.revoke_if_live(session_id, now).await? {
                debug!(session_id = %session_id, "Idle session already revoked");
                continue;
            }

            info!(wallet_id = %wallet_id, session_id = %session_id, "Idle session revoked");
            self.metrics.record_session_revoked();
            self.audit
                .append(
                    AuditEntry::new(AuditEventType::SessionRevoked, "autostop")
                        .wallet(wallet_id)
                        .details(serde_json::json!({
                            "action": "session_revoked",
                            "rule": AutoStopRule::IdleTimeout,
                            "sessionId": session_id,
                            "walletId": wallet_id,
                        })),
                )
                .await?;
            self.events
                .publish(LifecycleEvent::SessionRevoked {
                    wallet_id,
                    session_id,
                    at: now,
                })
                .await?;
            self.notifications
                .notify(
                    NotificationEvent::SessionRevoked,
                    Some(wallet_id),
                    serde_json::json!({
                        "walletId": wallet_id,
                        "sessionId": session_id,
                        "rule": AutoStopRule::IdleTimeout,
                    }),
                )
                .await;
            revoked.push((wallet_id, session_id));
        }
        Ok(revoked)
    }

    /// Trips the kill switch on behalf of `actor`.
    pub async fn manual_trigger(&self, actor: &str) -> CascadeResult {
        warn!(actor = %actor, "Manual autostop trigger");
        let result = self.kill_switch.activate_with_cascade(actor).await;
        self.notifications
            .notify(
                NotificationEvent::AutoStopTriggered,
                None,
                serde_json::json!({
                    "rule": AutoStopRule::ManualTrigger,
                    "reason": format!("Manual trigger by {}", actor),
                }),
            )
            .await;
        result
    }

    /// Starts tracking a session for the idle timeout.
    pub async fn register_session(&self, wallet_id: Uuid, session_id: Uuid, at: DateTime<Utc>) {
        self.detectors
            .lock()
            .await
            .idle
            .register_session(wallet_id, session_id, at);
    }

    /// Stops tracking a session.
    pub async fn remove_session(&self, wallet_id: Uuid, session_id: Uuid) {
        self.detectors
            .lock()
            .await
            .idle
            .remove_session(wallet_id, session_id);
    }

    /// Applies a partial config update. Detector state is kept.
    pub async fn update_config(&self, update: AutoStopConfigUpdate) -> Result<(), AutoStopError> {
        let mut config = self.config.write().await;
        let mut next = config.clone();
        if let Some(enabled) = update.enabled {
            next.enabled = enabled;
        }
        if let Some(v) = update.consecutive_failures_threshold {
            next.consecutive_failures_threshold = v;
        }
        if let Some(v) = update.unusual_activity_threshold {
            next.unusual_activity_threshold = v;
        }
        if let Some(v) = update.unusual_activity_window_secs {
            next.unusual_activity_window_secs = v;
        }
        if let Some(v) = update.idle_timeout_secs {
            next.idle_timeout_secs = v;
        }
        if let Some(v) = update.idle_check_interval_secs {
            next.idle_check_interval_secs = v;
        }
        next.validate()?;

        let mut detectors = self.detectors.lock().await;
        detectors
            .failures
            .update_threshold(next.consecutive_failures_threshold);
        detectors
            .activity
            .update_threshold(next.unusual_activity_threshold);
        detectors
            .activity
            .update_window(next.unusual_activity_window_secs);
        detectors.idle.update_timeout(next.idle_timeout_secs);

        info!(config = ?next, "Autostop config updated");
        *config = next;
        Ok(())
    }

    pub async fn status(&self) -> AutoStopStatus {
        let config = self.config.read().await.clone();
        let detectors = self.detectors.lock().await;
        AutoStopStatus {
            enabled: config.enabled,
            running: self.is_running(),
            consecutive_failures_tracked_wallets: detectors.failures.tracked_count(),
            unusual_activity_tracked_wallets: detectors.activity.tracked_count(),
            idle_tracked_sessions: detectors.idle.tracked_session_count(),
            config,
        }
    }
}

fn idle_interval(secs: u64) -> tokio::time::Interval {
    let period = std::time::Duration::from_secs(secs.max(1));
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval
}
