//! Periodic sweeps.
//!
//! Two loops run on `tokio::time::interval`:
//!
//! - the delay sweep releases QUEUED transactions whose cooldown elapsed and
//!   forwards them to the [`ExecutionHandoff`];
//! - the approval sweep cancels approvals past their deadline.
//!
//! Both stop when [`SweepWorkers::stop`] flips the shared `watch` channel.

use crate::approval::{ApprovalError, ApprovalWorkflow};
use crate::config::WalletGuardConfig;
use crate::delay_queue::{DelayQueue, DelayQueueError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use wg_core::Transaction;

/// Error returned by the execution pipeline.
#[derive(Error, Debug)]
#[error("Execution handoff failed for {tx_id}: {message}")]
pub struct HandoffError {
    pub tx_id: uuid::Uuid,
    pub message: String,
}

/// Receives transactions a sweep moved to EXECUTING.
#[async_trait]
pub trait ExecutionHandoff: Send + Sync {
    async fn hand_off(&self, tx: &Transaction) -> Result<(), HandoffError>;
}

/// Handoff that only logs. Used when no execution pipeline is attached.
#[derive(Debug, Default, Clone)]
pub struct LogHandoff;

#[async_trait]
impl ExecutionHandoff for LogHandoff {
    async fn hand_off(&self, tx: &Transaction) -> Result<(), HandoffError> {
        info!(tx_id = %tx.id, wallet_id = %tx.wallet_id, "Transaction ready for execution");
        Ok(())
    }
}

/// Errors that can occur during a sweep.
#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Delay sweep failed: {0}")]
    Delay(#[from] DelayQueueError),

    #[error("Approval sweep failed: {0}")]
    Approval(#[from] ApprovalError),
}

/// Owns the delay and approval sweep tasks.
pub struct SweepWorkers {
    delay_queue: Arc<DelayQueue>,
    approvals: Arc<ApprovalWorkflow>,
    handoff: Arc<dyn ExecutionHandoff>,
    delay_interval: Duration,
    approval_interval: Duration,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SweepWorkers {
    pub fn new(
        delay_queue: Arc<DelayQueue>,
        approvals: Arc<ApprovalWorkflow>,
        handoff: Arc<dyn ExecutionHandoff>,
        delay_interval: Duration,
        approval_interval: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            delay_queue,
            approvals,
            handoff,
            delay_interval,
            approval_interval,
            running: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Builds the workers with the intervals from `config`.
    pub fn from_config(
        delay_queue: Arc<DelayQueue>,
        approvals: Arc<ApprovalWorkflow>,
        handoff: Arc<dyn ExecutionHandoff>,
        config: &WalletGuardConfig,
    ) -> Self {
        Self::new(
            delay_queue,
            approvals,
            handoff,
            config.delay_sweep_interval(),
            config.approval_sweep_interval(),
        )
    }

    /// Spawns both sweep loops. A second call while running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Sweep workers already running");
            return;
        }
        self.shutdown_tx.send_replace(false);

        let delay = self.spawn_delay_sweep();
        let approval = self.spawn_approval_sweep();
        self.tasks.lock().await.extend([delay, approval]);

        info!(
            delay_interval_secs = self.delay_interval.as_secs(),
            approval_interval_secs = self.approval_interval.as_secs(),
            "Sweep workers started"
        );
    }

    /// Signals shutdown and waits for both loops to exit.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Sweep task ended abnormally");
            }
        }
        info!("Sweep workers stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs one delay sweep at `now` and hands every released transaction
    /// to the execution pipeline. Returns how many were released.
    ///
    /// A failed handoff is logged; the transaction stays EXECUTING.
    pub async fn sweep_delays(&self, now: DateTime<Utc>) -> Result<usize, SweepError> {
        let released = self.delay_queue.process_expired(now).await?;
        for tx in &released {
            if let Err(e) = self.handoff.hand_off(tx).await {
                error!(tx_id = %tx.id, error = %e, "Execution handoff failed");
            }
        }
        Ok(released.len())
    }

    /// Runs one approval sweep at `now`. Returns how many approvals expired.
    pub async fn sweep_approvals(&self, now: DateTime<Utc>) -> Result<usize, SweepError> {
        Ok(self.approvals.process_expired(now).await?.len())
    }

    fn spawn_delay_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let workers = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(workers.delay_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match workers.sweep_delays(Utc::now()).await {
                            Ok(0) => {}
                            Ok(count) => debug!(count, "Delay sweep released transactions"),
                            Err(e) => error!(error = %e, "Delay sweep failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Delay sweep shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_approval_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let workers = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(workers.approval_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match workers.sweep_approvals(Utc::now()).await {
                            Ok(0) => {}
                            Ok(count) => debug!(count, "Approval sweep expired approvals"),
                            Err(e) => error!(error = %e, "Approval sweep failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Approval sweep shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}
