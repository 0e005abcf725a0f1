use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use quota_limiter::Usage;
use serde::{Deserialize, Serialize};

/// Outcome of one generation attempt for one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsightRecord {
    pub chunk_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insight: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub generated_at: DateTime<Utc>,
}

impl InsightRecord {
    pub fn success(chunk_index: usize, insight: impl Into<String>, usage: Usage) -> Self {
        Self {
            chunk_index,
            insight: Some(insight.into()),
            error: None,
            usage: Some(usage),
            generated_at: Utc::now(),
        }
    }

    pub fn failure(chunk_index: usize, error: impl Into<String>) -> Self {
        Self {
            chunk_index,
            insight: None,
            error: Some(error.into()),
            usage: None,
            generated_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.insight.is_some()
    }

    /// The insight, or failing that the error text.
    pub fn display_text(&self) -> &str {
        self.insight
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.error.as_deref())
            .unwrap_or_default()
    }
}

/// Merge `latest` into `existing`: one record per chunk index, later records
/// win, ordered by index.
pub fn merge_insights(
    existing: Vec<InsightRecord>,
    latest: impl IntoIterator<Item = InsightRecord>,
) -> Vec<InsightRecord> {
    let mut by_index: BTreeMap<usize, InsightRecord> = existing
        .into_iter()
        .map(|record| (record.chunk_index, record))
        .collect();
    for record in latest {
        by_index.insert(record.chunk_index, record);
    }
    by_index.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage() -> Usage {
        Usage {
            total_tokens: 10,
            prompt_tokens: 6,
            completion_tokens: 4,
        }
    }

    #[test]
    fn test_merge_replaces_and_sorts() {
        let existing = vec![
            InsightRecord::failure(2, "Rate limit hit: token_rate_limit_exceeded"),
            InsightRecord::success(0, "first", usage()),
        ];
        let latest = vec![
            InsightRecord::success(3, "fourth", usage()),
            InsightRecord::success(2, "third", usage()),
            InsightRecord::success(1, "second", usage()),
        ];

        let merged = merge_insights(existing, latest);
        let indexes: Vec<usize> = merged.iter().map(|r| r.chunk_index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
        assert_eq!(merged[2].insight.as_deref(), Some("third"));
        assert!(merged[2].error.is_none());
    }

    #[test]
    fn test_merge_keeps_last_duplicate_in_batch() {
        let merged = merge_insights(
            Vec::new(),
            vec![
                InsightRecord::failure(0, "HTTP 429"),
                InsightRecord::success(0, "ok", usage()),
            ],
        );
        assert_eq!(merged.len(), 1);
        assert!(merged[0].is_success());
    }

    #[test]
    fn test_display_text_falls_back_to_error() {
        assert_eq!(InsightRecord::success(0, "deep", usage()).display_text(), "deep");
        assert_eq!(InsightRecord::failure(0, "HTTP 500").display_text(), "HTTP 500");
    }
}
