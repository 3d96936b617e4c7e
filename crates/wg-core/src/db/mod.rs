//! Persistence layer for Wallet Guard.
//!
//! Each store is a `#[async_trait]` repository trait with two implementations:
//! an in-memory one (always available) and a SQLite one behind the `database`
//! feature. The control plane only ever talks to the traits.

#[cfg(feature = "database")]
mod codec;
mod error;
pub mod memory;
mod pool;

pub mod approval_repo;
pub mod kill_switch_repo;
pub mod policy_repo;
pub mod transaction_repo;
pub mod wallet_repo;

pub use error::DbError;
pub use pool::{create_pool, PoolOptions};
#[cfg(feature = "database")]
pub use pool::{create_pool_with_options, run_migrations};

pub use approval_repo::ApprovalRepository;
pub use kill_switch_repo::KillSwitchRepository;
pub use policy_repo::{PolicyRepository, PolicyUpdate};
pub use transaction_repo::TransactionRepository;
pub use wallet_repo::{SessionRepository, WalletRepository};

#[cfg(feature = "database")]
pub use approval_repo::SqliteApprovalRepository;
#[cfg(feature = "database")]
pub use kill_switch_repo::SqliteKillSwitchRepository;
#[cfg(feature = "database")]
pub use policy_repo::SqlitePolicyRepository;
#[cfg(feature = "database")]
pub use transaction_repo::SqliteTransactionRepository;
#[cfg(feature = "database")]
pub use wallet_repo::{SqliteSessionRepository, SqliteWalletRepository};
