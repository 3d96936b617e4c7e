//! # wg-policy
//!
//! Risk controls for the Wallet Guard control plane.
//!
//! This crate resolves the effective policies of a wallet, evaluates single
//! and batch transaction requests into execution tiers, and runs the
//! workflows behind those tiers: the delay queue, owner approvals, the
//! autostop engine and the global kill switch. Outbound notifications pass
//! through a gate that mutes them while the kill switch is tripped.

pub mod approval;
pub mod autostop;
pub mod config;
pub mod delay_queue;
pub mod engine;
pub mod evaluators;
pub mod kill_switch;
pub mod notifications;
pub mod resolver;
pub mod workers;

pub use approval::{ApprovalError, ApprovalHandoff, ApprovalWorkflow};
pub use autostop::{AutoStopConfig, AutoStopError, AutoStopRule, AutoStopService, AutoStopStatus};
pub use config::{load_config, ConfigError, WalletGuardConfig};
pub use delay_queue::{DelayHandoff, DelayQueue, DelayQueueError};
pub use engine::{EngineError, PolicyEngine, PolicyEvaluation, DEFAULT_DELAY_SECONDS};
pub use evaluators::Denial;
pub use kill_switch::{
    CascadeResult, FleetHalt, KillSwitchConfig, KillSwitchError, KillSwitchService,
    KillSwitchStatus, KillSwitchStores, RecoveryOutcome, KILL_SWITCH_REASON,
};
pub use notifications::{
    CompositeNotifier, LogNotifier, NotificationEvent, NotificationGate, Notifier,
};
pub use resolver::{PolicyResolver, ResolvedPolicies};
pub use workers::{ExecutionHandoff, LogHandoff, SweepWorkers};
