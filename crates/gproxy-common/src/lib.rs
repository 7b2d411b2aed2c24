//! Glue shared by every other crate in the workspace: nothing here is
//! specific to a wire protocol or an upstream provider.

use uuid::Uuid;

/// A per-request trace id, threaded from the HTTP gateway down to adapter
/// logging so one dispatch's log lines can be grepped together.
pub fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}

/// Milliseconds since the Unix epoch, saturating rather than panicking if
/// the clock is somehow before 1970.
pub fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_ids_are_unique() {
        assert_ne!(new_trace_id(), new_trace_id());
    }

    #[test]
    fn now_millis_is_positive() {
        assert!(now_millis() > 0);
    }
}
