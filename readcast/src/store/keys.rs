//! Logical key layout and retention periods.

use std::time::Duration;

/// Subject data, progress and delivery markers.
pub const SUBJECT_DATA_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
/// Active schedule metadata.
pub const ACTIVE_SCHEDULE_TTL: Duration = SUBJECT_DATA_TTL;
/// Schedule metadata after completion.
pub const COMPLETED_SCHEDULE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Metric and audit records.
pub const METRICS_TTL: Duration = COMPLETED_SCHEDULE_TTL;

pub const METRICS_PATTERN: &str = "metrics:*";
pub const PROGRESS_PATTERN: &str = "subject_progress:*";
pub const SCHEDULE_PATTERN: &str = "subject_schedule:*";

const PROGRESS_PREFIX: &str = "subject_progress:";
const SCHEDULE_PREFIX: &str = "subject_schedule:";

pub fn chunks(subject_id: &str) -> String {
    format!("subject_chunks:{subject_id}")
}

pub fn insights(subject_id: &str) -> String {
    format!("subject_insights:{subject_id}")
}

pub fn schedule(subject_id: &str) -> String {
    format!("{SCHEDULE_PREFIX}{subject_id}")
}

pub fn progress(subject_id: &str) -> String {
    format!("{PROGRESS_PREFIX}{subject_id}")
}

pub fn delivery_marker(subject_id: &str, chunk_index: usize) -> String {
    format!("delivery_sent:{subject_id}:{chunk_index}")
}

pub fn metric(event: &str, subject_id: &str, timestamp_ms: Option<i64>) -> String {
    match timestamp_ms {
        Some(ts) => format!("metrics:{event}:{subject_id}:{ts}"),
        None => format!("metrics:{event}:{subject_id}"),
    }
}

/// Subject id of a `subject_progress:*` key.
pub fn subject_of_progress(key: &str) -> Option<&str> {
    key.strip_prefix(PROGRESS_PREFIX)
}

/// Subject id of a `subject_schedule:*` key.
pub fn subject_of_schedule(key: &str) -> Option<&str> {
    key.strip_prefix(SCHEDULE_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(chunks("u1"), "subject_chunks:u1");
        assert_eq!(delivery_marker("u1", 4), "delivery_sent:u1:4");
        assert_eq!(metric("error", "u1", Some(42)), "metrics:error:u1:42");
        assert_eq!(
            metric("schedule_created", "u1", None),
            "metrics:schedule_created:u1"
        );
    }

    #[test]
    fn test_subject_extraction() {
        assert_eq!(subject_of_progress(&progress("abc:def")), Some("abc:def"));
        assert_eq!(subject_of_schedule(&schedule("x")), Some("x"));
        assert_eq!(subject_of_progress("subject_schedule:x"), None);
    }
}
