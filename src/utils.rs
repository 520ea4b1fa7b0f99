//! Utility functions for the matchmaking service

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Generate a new unique party ID
pub fn generate_party_id() -> Uuid {
    Uuid::new_v4()
}

/// Generate a new unique match ID
pub fn generate_match_id() -> Uuid {
    Uuid::new_v4()
}

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Whole seconds a queue entry has been waiting as of `now`
pub fn wait_seconds(enqueued_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - enqueued_at).num_seconds().max(0)
}

/// Check whether two MMR values are within the given tolerance
pub fn mmr_within_tolerance(a: i32, b: i32, tolerance: i32) -> bool {
    (a - b).abs() <= tolerance
}
