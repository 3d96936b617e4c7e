//! Notification system for Wallet Guard.
//!
//! Control-plane components never talk to a channel directly: they call the
//! [`NotificationGate`], which decides whether a notification may go out at
//! all (kill switch, cooldown) and then hands it to a [`Notifier`] on a
//! spawned task.

mod gate;

pub use gate::{NotificationGate, NotifyOutcome};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Delivery failure reported by a channel.
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Notification delivery failed: {0}")]
    SendFailed(String),
}

/// Control-plane events owners are notified about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationEvent {
    TxQueued,
    TxDelayCancelled,
    TxApprovalRequired,
    TxApproved,
    TxRejected,
    TxApprovalExpired,
    AutoStopTriggered,
    SessionRevoked,
    KillSwitchActivated,
    KillSwitchEscalated,
    KillSwitchRecovered,
}

impl NotificationEvent {
    /// Returns the wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationEvent::TxQueued => "TX_QUEUED",
            NotificationEvent::TxDelayCancelled => "TX_DELAY_CANCELLED",
            NotificationEvent::TxApprovalRequired => "TX_APPROVAL_REQUIRED",
            NotificationEvent::TxApproved => "TX_APPROVED",
            NotificationEvent::TxRejected => "TX_REJECTED",
            NotificationEvent::TxApprovalExpired => "TX_APPROVAL_EXPIRED",
            NotificationEvent::AutoStopTriggered => "AUTO_STOP_TRIGGERED",
            NotificationEvent::SessionRevoked => "SESSION_REVOKED",
            NotificationEvent::KillSwitchActivated => "KILL_SWITCH_ACTIVATED",
            NotificationEvent::KillSwitchEscalated => "KILL_SWITCH_ESCALATED",
            NotificationEvent::KillSwitchRecovered => "KILL_SWITCH_RECOVERED",
        }
    }

    /// Critical events go to every channel at once instead of the first
    /// channel that accepts them.
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self,
            NotificationEvent::AutoStopTriggered
                | NotificationEvent::KillSwitchActivated
                | NotificationEvent::KillSwitchEscalated
                | NotificationEvent::KillSwitchRecovered
        )
    }

    /// Default priority for the event.
    pub fn priority(&self) -> NotificationPriority {
        match self {
            NotificationEvent::TxQueued
            | NotificationEvent::TxApproved
            | NotificationEvent::TxDelayCancelled => NotificationPriority::Normal,
            NotificationEvent::TxRejected
            | NotificationEvent::TxApprovalExpired
            | NotificationEvent::SessionRevoked => NotificationPriority::Low,
            NotificationEvent::TxApprovalRequired | NotificationEvent::AutoStopTriggered => {
                NotificationPriority::High
            }
            NotificationEvent::KillSwitchActivated
            | NotificationEvent::KillSwitchEscalated
            | NotificationEvent::KillSwitchRecovered => NotificationPriority::Urgent,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            NotificationEvent::TxQueued => "Transaction queued",
            NotificationEvent::TxDelayCancelled => "Delayed transaction cancelled",
            NotificationEvent::TxApprovalRequired => "Approval required",
            NotificationEvent::TxApproved => "Transaction approved",
            NotificationEvent::TxRejected => "Transaction rejected",
            NotificationEvent::TxApprovalExpired => "Approval expired",
            NotificationEvent::AutoStopTriggered => "Wallet suspended by autostop",
            NotificationEvent::SessionRevoked => "Idle session revoked",
            NotificationEvent::KillSwitchActivated => "Kill switch activated",
            NotificationEvent::KillSwitchEscalated => "Kill switch locked",
            NotificationEvent::KillSwitchRecovered => "Kill switch recovered",
        }
    }
}

impl std::fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority level for notifications.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Normal,
    High,
    Urgent,
}

/// A notification to be sent through one or more channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// Unique identifier for the notification.
    pub id: Uuid,
    pub event_type: NotificationEvent,
    /// `None` for global events such as kill switch transitions.
    pub wallet_id: Option<Uuid>,
    pub title: String,
    pub priority: NotificationPriority,
    /// Event-specific details.
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Creates a notification with the event's default title and priority.
    pub fn new(
        event_type: NotificationEvent,
        wallet_id: Option<Uuid>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            wallet_id,
            title: event_type.title().to_string(),
            priority: event_type.priority(),
            details,
            created_at: Utc::now(),
        }
    }
}

/// Trait for notification channels.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends a notification.
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError>;

    /// Returns the name of the notifier.
    fn name(&self) -> &str;
}

/// A notifier that logs notifications via tracing.
#[derive(Debug, Default)]
pub struct LogNotifier {
    name: String,
}

impl LogNotifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    #[instrument(skip(self, notification), fields(notifier = %self.name))]
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        info!(
            notification_id = %notification.id,
            event_type = %notification.event_type,
            wallet_id = ?notification.wallet_id,
            priority = ?notification.priority,
            title = %notification.title,
            "Notification sent via LogNotifier"
        );
        debug!(details = %notification.details, "Notification details");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Fans a notification out over several channels.
///
/// Broadcast events go to every channel. Everything else is tried channel by
/// channel in order and stops at the first success. Either way the send only
/// fails when every channel failed.
pub struct CompositeNotifier {
    channels: Vec<Arc<dyn Notifier>>,
    /// Whether a broadcast keeps going past a failed channel.
    continue_on_error: bool,
}

impl CompositeNotifier {
    pub fn new(channels: Vec<Arc<dyn Notifier>>) -> Self {
        Self {
            channels,
            continue_on_error: true,
        }
    }

    /// Aborts a broadcast at the first failed channel.
    pub fn fail_fast(mut self) -> Self {
        self.continue_on_error = false;
        self
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[async_trait]
impl Notifier for CompositeNotifier {
    #[instrument(
        skip(self, notification),
        fields(channels = self.channels.len(), event_type = %notification.event_type)
    )]
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        if self.channels.is_empty() {
            warn!("No notification channels configured");
            return Ok(());
        }

        let broadcast = notification.event_type.is_broadcast();
        let mut failures = Vec::new();

        for channel in &self.channels {
            match channel.send(notification).await {
                Ok(()) => {
                    debug!(channel = %channel.name(), "Notification delivered");
                    if !broadcast {
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(channel = %channel.name(), error = %e, "Notification channel failed");
                    if broadcast && !self.continue_on_error {
                        return Err(e);
                    }
                    failures.push(format!("{}: {}", channel.name(), e));
                }
            }
        }

        if failures.len() == self.channels.len() {
            return Err(NotificationError::SendFailed(failures.join("; ")));
        }
        if !failures.is_empty() {
            warn!(
                failed = failures.len(),
                channels = self.channels.len(),
                "Broadcast partially delivered"
            );
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "composite"
    }
}
