//! Utility functions for execution ids and timestamp handling.

pub mod timestamps;

pub use timestamps::{iso_timestamp, now_utc, seconds_between, Timestamp};

use uuid::Uuid;

/// Generates a new opaque execution id (UUID v4).
#[must_use]
pub fn generate_execution_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_id_is_uuid_v4() {
        let id = generate_execution_id();
        let parsed = Uuid::parse_str(&id).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn test_execution_ids_are_unique() {
        assert_ne!(generate_execution_id(), generate_execution_id());
    }

    #[test]
    fn test_iso_timestamp_format() {
        let ts = iso_timestamp();
        assert!(ts.contains('T'));
        assert!(ts.ends_with("+00:00"));
    }
}
