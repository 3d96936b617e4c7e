//! In-memory implementations of the repository traits.
//!
//! These back the control plane when the `database` feature is off and are
//! what the unit and integration tests run against. Conditional writes are
//! performed under a single write lock, which gives them the same
//! at-most-one-winner behavior as the SQLite `UPDATE ... WHERE` statements.

mod approval_repo;
mod kill_switch_repo;
mod policy_repo;
mod transaction_repo;
mod wallet_repo;

pub use approval_repo::InMemoryApprovalRepository;
pub use kill_switch_repo::InMemoryKillSwitchRepository;
pub use policy_repo::InMemoryPolicyRepository;
pub use transaction_repo::InMemoryTransactionRepository;
pub use wallet_repo::{InMemorySessionRepository, InMemoryWalletRepository};
