//! Millisecond timestamps.
//!
//! The broker stores times as epoch milliseconds (sorted-set scores in Redis);
//! the public model uses `chrono`.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Current time as epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Convert epoch milliseconds back to a `DateTime`; values past chrono's range
/// clamp to its minimum or maximum.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or(if ms < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

/// `at_ms + duration`, saturating at `i64::MAX`.
pub fn millis_after(at_ms: i64, duration: Duration) -> i64 {
    at_ms.saturating_add(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_round_trip() {
        let now = now_millis();
        assert_eq!(to_millis(from_millis(now)), now);
    }

    #[test]
    fn out_of_range_values_saturate() {
        assert_eq!(millis_after(i64::MAX - 1, Duration::from_millis(10)), i64::MAX);
        assert_eq!(millis_after(0, Duration::from_secs(u64::MAX)), i64::MAX);
        assert_eq!(millis_after(5, Duration::from_millis(10)), 15);
        assert_eq!(from_millis(i64::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(from_millis(i64::MIN), DateTime::<Utc>::MIN_UTC);
    }
}
