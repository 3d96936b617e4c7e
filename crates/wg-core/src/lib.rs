//! # wg-core
//!
//! Domain models, lifecycle events and persistence for the Wallet Guard
//! control plane.
//!
//! This crate holds the types every control-plane component shares: policies
//! and their typed rules, transaction requests and rows, wallets, sessions,
//! the kill switch record, the lifecycle event bus and the repository traits
//! that persist them.

pub mod amount;
pub mod db;
pub mod events;
pub mod kill_switch;
pub mod policy;
pub mod time;
pub mod transaction;
pub mod wallet;

pub use amount::{Amount, AmountParseError};
pub use events::{EventBus, EventBusError, LifecycleEvent};
pub use kill_switch::{KillSwitchRecord, KillSwitchState};
pub use policy::{
    AllowedNetworksRules, AllowedTokensRules, ApproveAmountLimitRules, ApproveTierOverrideRules,
    ApprovedSpendersRules, ContractEntry, ContractWhitelistRules, MethodEntry, MethodWhitelistRules,
    NetworkEntry, Policy, PolicyRules, PolicyType, SpenderEntry, SpendingLimitRules, Tier,
    TokenEntry, WhitelistRules, X402AllowedDomainsRules,
};
pub use transaction::{
    ApprovalResolution, PendingApproval, Transaction, TransactionRequest, TransactionStatus,
    TransactionType, TransactionUpdate,
};
pub use wallet::{Session, Wallet, WalletStatus};
