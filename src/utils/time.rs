//! Timestamp helpers shared by the Fact Store and the Registry.

use chrono::Utc;

/// Seconds since the unix epoch.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Milliseconds since the unix epoch.
pub fn unix_now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
