//! Wallet and session views.
//!
//! Wallets and sessions are owned by the wallet-management collaborator. The
//! control plane only reads them, suspends wallets and revokes sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a wallet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletStatus {
    Active,
    Suspended,
    Terminated,
}

impl WalletStatus {
    /// Returns the database-compatible string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            WalletStatus::Active => "ACTIVE",
            WalletStatus::Suspended => "SUSPENDED",
            WalletStatus::Terminated => "TERMINATED",
        }
    }

    /// Parses a WalletStatus from a database string.
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(WalletStatus::Active),
            "SUSPENDED" => Some(WalletStatus::Suspended),
            "TERMINATED" => Some(WalletStatus::Terminated),
            _ => None,
        }
    }
}

impl std::fmt::Display for WalletStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// A custodial wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    pub chain: String,
    pub network: String,
    pub environment: String,
    pub status: WalletStatus,
    pub suspended_at: Option<DateTime<Utc>>,
    pub suspension_reason: Option<String>,
}

impl Wallet {
    /// Creates an active wallet.
    pub fn new(
        chain: impl Into<String>,
        network: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            chain: chain.into(),
            network: network.into(),
            environment: environment.into(),
            status: WalletStatus::Active,
            suspended_at: None,
            suspension_reason: None,
        }
    }
}

/// An agent session bound to a wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Creates a live session.
    pub fn new(wallet_id: Uuid, expires_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            wallet_id,
            expires_at,
            revoked_at: None,
        }
    }

    /// Returns true if the session is neither revoked nor expired at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at > now
    }
}
