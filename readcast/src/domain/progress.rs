use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position of a subject's delivery cursor.
///
/// `current_index` and `processed_count` only ever grow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
    pub current_index: usize,
    pub processed_count: usize,
    #[serde(default)]
    pub last_processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_task_id: Option<String>,
}

impl ProgressState {
    pub fn starting_at(index: usize) -> Self {
        Self {
            current_index: index,
            ..Default::default()
        }
    }

    /// Progress after delivering `[current_index, end)`.
    pub fn advanced(&self, end: usize, task_id: impl Into<String>) -> Self {
        let end = end.max(self.current_index);
        Self {
            current_index: end,
            processed_count: self.processed_count + (end - self.current_index),
            last_processed_at: Some(Utc::now()),
            last_task_id: Some(task_id.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advanced_is_monotonic() {
        let progress = ProgressState::starting_at(1).advanced(3, "t1");
        assert_eq!(progress.current_index, 3);
        assert_eq!(progress.processed_count, 2);
        assert_eq!(progress.last_task_id.as_deref(), Some("t1"));

        let stale = progress.advanced(2, "t2");
        assert_eq!(stale.current_index, 3);
        assert_eq!(stale.processed_count, 2);
    }
}
