//! UUID v7 utilities for time-ordered identifiers.
//!
//! Every identifier OmniLake mints (jobs, lake requests, chains, entries,
//! queue events) is a UUIDv7, so ids sort by creation time.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// Extract the embedded creation timestamp from a UUIDv7.
///
/// Returns `None` for other UUID versions.
pub fn extract_timestamp(id: &Uuid) -> Option<DateTime<Utc>> {
    if !is_v7(id) {
        return None;
    }
    let bytes = id.as_bytes();
    let mut millis: i64 = 0;
    for b in &bytes[0..6] {
        millis = (millis << 8) | i64::from(*b);
    }
    Utc.timestamp_millis_opt(millis).single()
}

/// Check whether a UUID is version 7.
#[inline]
pub fn is_v7(id: &Uuid) -> bool {
    id.get_version_num() == 7
}
