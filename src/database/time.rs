//! Instant handling for persisted rows.
//!
//! Every persisted instant (creation times, lease deadlines, backoff slots)
//! is an INTEGER column of Unix epoch milliseconds, UTC. Milliseconds are
//! the unit the engine already reasons in (timeouts, retry delays), and
//! integer instants keep lease arithmetic like `expires_at > now` inside
//! plain SQL.

use chrono::{DateTime, Utc};

/// Current instant as epoch milliseconds.
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Render a persisted instant for logs or API payloads.
///
/// Rows written by foreign tools can carry garbage; instants outside
/// chrono's range saturate instead of failing.
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(if ms < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let now = now_ms();
        assert_eq!(ms_to_datetime(now).timestamp_millis(), now);
    }

    #[test]
    fn test_out_of_range_saturates() {
        assert_eq!(ms_to_datetime(i64::MIN), DateTime::<Utc>::MIN_UTC);
        assert_eq!(ms_to_datetime(i64::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
