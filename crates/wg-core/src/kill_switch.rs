//! Persisted kill switch state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Global kill switch state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KillSwitchState {
    /// Normal operation.
    Active,
    /// Soft stop: notifications muted.
    Suspended,
    /// Hard stop reached by escalation.
    Locked,
}

impl KillSwitchState {
    /// Returns the database-compatible string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            KillSwitchState::Active => "ACTIVE",
            KillSwitchState::Suspended => "SUSPENDED",
            KillSwitchState::Locked => "LOCKED",
        }
    }

    /// Parses a KillSwitchState from a database string.
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(KillSwitchState::Active),
            "SUSPENDED" => Some(KillSwitchState::Suspended),
            "LOCKED" => Some(KillSwitchState::Locked),
            _ => None,
        }
    }
}

impl std::fmt::Display for KillSwitchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// Singleton kill switch record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillSwitchRecord {
    pub state: KillSwitchState,
    pub activated_at: Option<DateTime<Utc>>,
    pub activated_by: Option<String>,
    /// When the record last changed state. Recovery cooldowns run from here.
    pub transitioned_at: Option<DateTime<Utc>>,
    /// Premature recovery attempts since the last transition.
    pub failed_recovery_attempts: u32,
}

impl KillSwitchRecord {
    /// The record of a switch that has never been tripped.
    pub fn active() -> Self {
        Self {
            state: KillSwitchState::Active,
            activated_at: None,
            activated_by: None,
            transitioned_at: None,
            failed_recovery_attempts: 0,
        }
    }
}

impl Default for KillSwitchRecord {
    fn default() -> Self {
        Self::active()
    }
}
