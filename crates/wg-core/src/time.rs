//! Conversions from configured second counts to chrono durations.
//!
//! Delays, timeouts and windows arrive as `u64` seconds from policy rules and
//! configuration. Not every `u64` is a representable [`Duration`], and not
//! every representable offset keeps a timestamp in range, so the arithmetic
//! here is checked.

use chrono::{DateTime, Duration, Utc};

/// `secs` as a [`Duration`], or `None` when it does not fit.
pub fn seconds(secs: u64) -> Option<Duration> {
    i64::try_from(secs).ok().and_then(Duration::try_seconds)
}

/// `secs` as a [`Duration`], saturating at the largest representable value.
pub fn saturating_seconds(secs: u64) -> Duration {
    seconds(secs).unwrap_or(Duration::MAX)
}

/// `at + secs`, or `None` when the result is out of range.
pub fn checked_add_secs(at: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    seconds(secs).and_then(|offset| at.checked_add_signed(offset))
}

/// `at - window`, clamped to the earliest representable instant.
pub fn saturating_sub(at: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
