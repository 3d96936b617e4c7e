//! Lifecycle event bus for Wallet Guard.
//!
//! Producers (the execution pipeline, the delay queue, the approval workflow,
//! the kill switch) publish typed [`LifecycleEvent`]s. Consumers either take a
//! broadcast receiver or register a named subscriber with its own bounded
//! `mpsc` channel. Named subscribers are how the autostop engine receives its
//! input: events that feed a detector are delivered with back-pressure, the
//! rest are best-effort.

use crate::kill_switch::KillSwitchState;
use crate::transaction::TransactionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// How long a critical event may wait on a full subscriber channel.
const CRITICAL_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur in the event bus.
#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Failed to send event: {0}")]
    SendError(String),

    #[error("Subscriber not found: {0}")]
    SubscriberNotFound(String),
}

/// Events emitted over a transaction's and wallet's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Execution of a transaction failed.
    TransactionFailed {
        wallet_id: Uuid,
        tx_id: Uuid,
        error: String,
        at: DateTime<Utc>,
    },
    /// A transaction was confirmed on chain.
    TransactionCompleted {
        wallet_id: Uuid,
        tx_id: Uuid,
        at: DateTime<Utc>,
    },
    /// Any agent activity on a wallet, optionally tied to a session.
    WalletActivity {
        wallet_id: Uuid,
        session_id: Option<Uuid>,
        activity: String,
        at: DateTime<Utc>,
    },
    /// A DELAY-tier transaction entered the delay queue.
    TransactionQueued {
        wallet_id: Uuid,
        tx_id: Uuid,
        delay_until: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    /// An APPROVAL-tier transaction is waiting on a human.
    ApprovalRequested {
        wallet_id: Uuid,
        tx_id: Uuid,
        expires_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    /// A held transaction left the delay queue or approval workflow.
    TransactionReleased {
        wallet_id: Uuid,
        tx_id: Uuid,
        status: TransactionStatus,
        reason: String,
        at: DateTime<Utc>,
    },
    /// The autostop engine suspended a wallet.
    WalletSuspended {
        wallet_id: Uuid,
        rule: String,
        reason: String,
        at: DateTime<Utc>,
    },
    /// The autostop engine revoked an idle session.
    SessionRevoked {
        wallet_id: Uuid,
        session_id: Uuid,
        at: DateTime<Utc>,
    },
    /// The kill switch changed state.
    KillSwitchStateChanged {
        from: KillSwitchState,
        to: KillSwitchState,
        actor: String,
        at: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    /// Returns the canonical event name, e.g. `transaction:failed`.
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::TransactionFailed { .. } => "transaction:failed",
            LifecycleEvent::TransactionCompleted { .. } => "transaction:completed",
            LifecycleEvent::WalletActivity { .. } => "wallet:activity",
            LifecycleEvent::TransactionQueued { .. } => "transaction:queued",
            LifecycleEvent::ApprovalRequested { .. } => "approval:requested",
            LifecycleEvent::TransactionReleased { .. } => "transaction:released",
            LifecycleEvent::WalletSuspended { .. } => "wallet:suspended",
            LifecycleEvent::SessionRevoked { .. } => "session:revoked",
            LifecycleEvent::KillSwitchStateChanged { .. } => "kill-switch:state-changed",
        }
    }

    /// Returns the wallet this event concerns, if any.
    pub fn wallet_id(&self) -> Option<Uuid> {
        match self {
            LifecycleEvent::TransactionFailed { wallet_id, .. }
            | LifecycleEvent::TransactionCompleted { wallet_id, .. }
            | LifecycleEvent::WalletActivity { wallet_id, .. }
            | LifecycleEvent::TransactionQueued { wallet_id, .. }
            | LifecycleEvent::ApprovalRequested { wallet_id, .. }
            | LifecycleEvent::TransactionReleased { wallet_id, .. }
            | LifecycleEvent::WalletSuspended { wallet_id, .. }
            | LifecycleEvent::SessionRevoked { wallet_id, .. } => Some(*wallet_id),
            LifecycleEvent::KillSwitchStateChanged { .. } => None,
        }
    }

    /// Events that feed autostop detectors must not be dropped.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::TransactionFailed { .. }
                | LifecycleEvent::TransactionCompleted { .. }
                | LifecycleEvent::WalletActivity { .. }
        )
    }
}

/// In-process event bus.
pub struct EventBus {
    /// Broadcast channel for all events.
    broadcast_tx: broadcast::Sender<LifecycleEvent>,
    /// Named subscribers with dedicated channels.
    subscribers: Arc<RwLock<HashMap<String, mpsc::Sender<LifecycleEvent>>>>,
    history_size: usize,
    history: Arc<RwLock<VecDeque<LifecycleEvent>>>,
    /// Non-critical events dropped because a subscriber was full.
    dropped_events: AtomicU64,
}

impl EventBus {
    /// Creates a new event bus with the specified broadcast capacity.
    pub fn new(capacity: usize) -> Self {
        Self::with_history_size(capacity, 1000)
    }

    /// Creates a new event bus with custom history size.
    pub fn with_history_size(capacity: usize, history_size: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity);
        Self {
            broadcast_tx,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            history_size,
            history: Arc::new(RwLock::new(VecDeque::with_capacity(history_size))),
            dropped_events: AtomicU64::new(0),
        }
    }

    /// Returns the number of dropped events since the bus was created.
    pub fn dropped_event_count(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Publishes an event to history, broadcast receivers and named subscribers.
    ///
    /// Critical events wait (bounded) for room in each subscriber channel.
    /// Everything else uses `try_send`, so a subscriber that publishes from
    /// inside its own handler can never block on itself.
    #[instrument(skip(self, event), fields(event = event.name()))]
    pub async fn publish(&self, event: LifecycleEvent) -> Result<(), EventBusError> {
        {
            let mut history = self.history.write().await;
            if history.len() >= self.history_size {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        match self.broadcast_tx.send(event.clone()) {
            Ok(count) => debug!("Event broadcast to {} receivers", count),
            Err(_) => debug!("No broadcast receivers for event"),
        }

        let subscribers = self.subscribers.read().await;
        let is_critical = event.is_critical();

        for (name, tx) in subscribers.iter() {
            if is_critical {
                match tokio::time::timeout(CRITICAL_SEND_TIMEOUT, tx.send(event.clone())).await {
                    Ok(Ok(())) => debug!(subscriber = %name, "Critical event delivered"),
                    Ok(Err(_)) => error!(
                        subscriber = %name,
                        "Failed to deliver critical event: channel closed"
                    ),
                    Err(_) => error!(
                        subscriber = %name,
                        "Timeout delivering critical event - subscriber may be stalled"
                    ),
                }
            } else if let Err(e) = tx.try_send(event.clone()) {
                let dropped = self.dropped_events.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 100 == 1 {
                    warn!(
                        subscriber = %name,
                        total_dropped = dropped,
                        error = %e,
                        "Event dropped for subscriber"
                    );
                }
            }
        }

        Ok(())
    }

    /// Subscribes to the broadcast channel.
    pub fn subscribe_broadcast(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Registers a named subscriber with a dedicated channel.
    pub async fn register_subscriber(
        &self,
        name: &str,
        buffer_size: usize,
    ) -> mpsc::Receiver<LifecycleEvent> {
        let (tx, rx) = mpsc::channel(buffer_size);
        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(name.to_string(), tx);
        info!(subscriber = %name, "Registered event subscriber");
        rx
    }

    /// Unregisters a named subscriber.
    pub async fn unregister_subscriber(&self, name: &str) -> Result<(), EventBusError> {
        let mut subscribers = self.subscribers.write().await;
        if subscribers.remove(name).is_some() {
            info!(subscriber = %name, "Unregistered event subscriber");
            Ok(())
        } else {
            Err(EventBusError::SubscriberNotFound(name.to_string()))
        }
    }

    /// Gets recent event history, newest first when limited.
    pub async fn get_history(&self, limit: Option<usize>) -> Vec<LifecycleEvent> {
        let history = self.history.read().await;
        match limit {
            Some(n) => history.iter().rev().take(n).cloned().collect(),
            None => history.iter().cloned().collect(),
        }
    }

    /// Gets events concerning a specific wallet, oldest first.
    pub async fn get_wallet_events(&self, wallet_id: Uuid) -> Vec<LifecycleEvent> {
        let history = self.history.read().await;
        history
            .iter()
            .filter(|event| event.wallet_id() == Some(wallet_id))
            .cloned()
            .collect()
    }

    /// Gets the number of active subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len() + self.broadcast_tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
