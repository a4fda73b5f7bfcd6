//! Small shared helpers.

use plinth_sql::Value;
use ulid::Ulid;

/// New time-ordered record id.
pub fn new_id() -> String {
    Ulid::new().to_string()
}

/// Current time as a microsecond timestamp value.
pub fn now() -> Value {
    Value::Timestamp(chrono::Utc::now().timestamp_micros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_sortable_and_unique() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 26);
    }

    #[test]
    fn test_now_is_timestamp() {
        assert!(matches!(now(), Value::Timestamp(t) if t > 0));
    }
}
