//! Column encodings shared by the SQLite stores.
//!
//! Ordinary timestamps are RFC 3339 text with fixed microsecond precision so
//! that lexical order matches chronological order. Deadlines that sweeps
//! compare against (`delay_until`, `expires_at`) are integer epoch seconds.

use super::DbError;
use crate::amount::Amount;
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

pub(crate) fn timestamp_to_db(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn timestamp_from_db(s: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::Serialization(format!("invalid timestamp '{}': {}", s, e)))
}

pub(crate) fn epoch_from_db(secs: i64) -> Result<DateTime<Utc>, DbError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| DbError::Serialization(format!("epoch seconds out of range: {}", secs)))
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, DbError> {
    Uuid::parse_str(s).map_err(|e| DbError::Serialization(format!("invalid uuid '{}': {}", s, e)))
}

pub(crate) fn amount_from_db(s: &str) -> Result<Amount, DbError> {
    Ok(s.parse()?)
}
