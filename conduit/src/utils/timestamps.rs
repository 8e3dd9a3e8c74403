//! Timestamp helpers for execution records.

use chrono::{DateTime, Utc};

/// Timestamps stored on execution records.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Returns the current UTC time as an ISO 8601 string with microseconds.
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Whole seconds elapsed from `earlier` to `later`, clamped at zero.
#[must_use]
pub fn seconds_between(earlier: Timestamp, later: Timestamp) -> u64 {
    u64::try_from((later - earlier).num_seconds()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_seconds_between() {
        let start = now_utc();
        let later = start + Duration::seconds(90);
        assert_eq!(seconds_between(start, later), 90);
    }

    #[test]
    fn test_seconds_between_clamps_negative() {
        let start = now_utc();
        let earlier = start - Duration::seconds(5);
        assert_eq!(seconds_between(start, earlier), 0);
    }
}
