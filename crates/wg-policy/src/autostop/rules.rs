//! Autostop detectors.
//!
//! Each detector is plain state plus a threshold; none of them touch storage.
//! The service feeds them events and acts on what they report.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;
use wg_core::time;

/// Which rule caused a suspension or revocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AutoStopRule {
    ConsecutiveFailures,
    UnusualActivity,
    IdleTimeout,
    ManualTrigger,
}

impl AutoStopRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoStopRule::ConsecutiveFailures => "CONSECUTIVE_FAILURES",
            AutoStopRule::UnusualActivity => "UNUSUAL_ACTIVITY",
            AutoStopRule::IdleTimeout => "IDLE_TIMEOUT",
            AutoStopRule::ManualTrigger => "MANUAL_TRIGGER",
        }
    }
}

impl std::fmt::Display for AutoStopRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts failed transactions in a row per wallet.
#[derive(Debug)]
pub struct ConsecutiveFailuresRule {
    counts: HashMap<Uuid, u32>,
    threshold: u32,
}

impl ConsecutiveFailuresRule {
    pub fn new(threshold: u32) -> Self {
        Self {
            counts: HashMap::new(),
            threshold,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Records a failure. Returns true once the run reaches the threshold.
    pub fn on_failure(&mut self, wallet_id: Uuid) -> bool {
        let count = self.counts.entry(wallet_id).or_insert(0);
        *count += 1;
        *count >= self.threshold
    }

    /// A success breaks the run.
    pub fn on_success(&mut self, wallet_id: Uuid) {
        self.counts.remove(&wallet_id);
    }

    pub fn count(&self, wallet_id: Uuid) -> u32 {
        self.counts.get(&wallet_id).copied().unwrap_or(0)
    }

    pub fn reset_wallet(&mut self, wallet_id: Uuid) {
        self.counts.remove(&wallet_id);
    }

    pub fn update_threshold(&mut self, threshold: u32) {
        self.threshold = threshold;
    }

    pub fn tracked_count(&self) -> usize {
        self.counts.len()
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}

/// Sliding-window activity counter per wallet.
#[derive(Debug)]
pub struct UnusualActivityRule {
    timestamps: HashMap<Uuid, VecDeque<DateTime<Utc>>>,
    threshold: u32,
    window: Duration,
}

impl UnusualActivityRule {
    pub fn new(threshold: u32, window_secs: u64) -> Self {
        Self {
            timestamps: HashMap::new(),
            threshold,
            window: time::saturating_seconds(window_secs),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Records activity at `at`. Returns true when the window holds at least
    /// `threshold` entries.
    pub fn on_activity(&mut self, wallet_id: Uuid, at: DateTime<Utc>) -> bool {
        let cutoff = time::saturating_sub(at, self.window);
        let entries = self.timestamps.entry(wallet_id).or_default();
        while entries.front().is_some_and(|t| *t <= cutoff) {
            entries.pop_front();
        }
        entries.push_back(at);
        entries.len() >= self.threshold as usize
    }

    pub fn reset_wallet(&mut self, wallet_id: Uuid) {
        self.timestamps.remove(&wallet_id);
    }

    pub fn update_threshold(&mut self, threshold: u32) {
        self.threshold = threshold;
    }

    pub fn update_window(&mut self, window_secs: u64) {
        self.window = time::saturating_seconds(window_secs);
    }

    pub fn tracked_count(&self) -> usize {
        self.timestamps.len()
    }

    pub fn clear(&mut self) {
        self.timestamps.clear();
    }
}

/// Last activity per tracked session, grouped by wallet.
#[derive(Debug)]
pub struct IdleTimeoutRule {
    last_activity: HashMap<Uuid, HashMap<Uuid, DateTime<Utc>>>,
    timeout: Duration,
}

impl IdleTimeoutRule {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            last_activity: HashMap::new(),
            timeout: time::saturating_seconds(timeout_secs),
        }
    }

    /// Starts tracking a session.
    pub fn register_session(&mut self, wallet_id: Uuid, session_id: Uuid, at: DateTime<Utc>) {
        self.last_activity
            .entry(wallet_id)
            .or_default()
            .insert(session_id, at);
    }

    /// Refreshes the session's timer, or every tracked session of the wallet
    /// when no session is given. Untracked sessions are ignored.
    pub fn on_activity(&mut self, wallet_id: Uuid, at: DateTime<Utc>, session_id: Option<Uuid>) {
        let Some(sessions) = self.last_activity.get_mut(&wallet_id) else {
            return;
        };
        match session_id {
            Some(id) => {
                if let Some(last) = sessions.get_mut(&id) {
                    *last = at;
                }
            }
            None => sessions.values_mut().for_each(|last| *last = at),
        }
    }

    /// The instant before which a session counts as idle at `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        time::saturating_sub(now, self.timeout)
    }

    /// Sessions whose last activity is before `cutoff`, as (wallet, session).
    pub fn idle_sessions(&self, cutoff: DateTime<Utc>) -> Vec<(Uuid, Uuid)> {
        self.last_activity
            .iter()
            .flat_map(|(wallet_id, sessions)| {
                sessions
                    .iter()
                    .filter(move |(_, last)| **last < cutoff)
                    .map(move |(session_id, _)| (*wallet_id, *session_id))
            })
            .collect()
    }

    /// Returns true if the session is still tracked and still idle.
    pub fn is_idle(&self, wallet_id: Uuid, session_id: Uuid, cutoff: DateTime<Utc>) -> bool {
        self.last_activity
            .get(&wallet_id)
            .and_then(|sessions| sessions.get(&session_id))
            .is_some_and(|last| *last < cutoff)
    }

    pub fn remove_session(&mut self, wallet_id: Uuid, session_id: Uuid) {
        if let Some(sessions) = self.last_activity.get_mut(&wallet_id) {
            sessions.remove(&session_id);
            if sessions.is_empty() {
                self.last_activity.remove(&wallet_id);
            }
        }
    }

    pub fn update_timeout(&mut self, timeout_secs: u64) {
        self.timeout = time::saturating_seconds(timeout_secs);
    }

    pub fn tracked_session_count(&self) -> usize {
        self.last_activity.values().map(HashMap::len).sum()
    }

    pub fn clear(&mut self) {
        self.last_activity.clear();
    }
}
