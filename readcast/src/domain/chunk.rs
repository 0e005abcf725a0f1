use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One bounded unit of a subject's text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// 0-based, contiguous within a chunk set.
    pub index: usize,
    pub text: String,
    /// Estimated token count of `text`.
    pub token_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insight: Option<String>,
}

impl Chunk {
    /// `max(1, chars / 4)`.
    pub fn estimate_tokens(text: &str) -> u64 {
        (text.chars().count() as u64 / 4).max(1)
    }
}

/// All chunks ingested for one subject. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectChunkSet {
    pub subject_id: String,
    pub recipient: String,
    pub chunks: Vec<Chunk>,
    pub total_chunks: usize,
    pub created_at: DateTime<Utc>,
}

impl SubjectChunkSet {
    pub fn new(
        subject_id: impl Into<String>,
        recipient: impl Into<String>,
        texts: Vec<String>,
    ) -> Self {
        let chunks: Vec<Chunk> = texts
            .into_iter()
            .enumerate()
            .map(|(index, text)| Chunk {
                index,
                token_count: Chunk::estimate_tokens(&text),
                text,
                insight: None,
            })
            .collect();

        Self {
            subject_id: subject_id.into(),
            recipient: recipient.into(),
            total_chunks: chunks.len(),
            chunks,
            created_at: Utc::now(),
        }
    }

    pub fn chunk(&self, index: usize) -> Option<&Chunk> {
        self.chunks.get(index)
    }

    /// Chunks in `[start, end)`, clamped to the set.
    pub fn slice(&self, start: usize, end: usize) -> &[Chunk] {
        let end = end.min(self.chunks.len());
        let start = start.min(end);
        &self.chunks[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_set_indexes_and_estimates() {
        let set = SubjectChunkSet::new(
            "s1",
            "reader@example.com",
            vec!["a".repeat(40), "b".into()],
        );

        assert_eq!(set.total_chunks, 2);
        assert_eq!(set.chunks[0].index, 0);
        assert_eq!(set.chunks[0].token_count, 10);
        assert_eq!(set.chunks[1].index, 1);
        assert_eq!(set.chunks[1].token_count, 1);
    }

    #[test]
    fn test_slice_is_clamped() {
        let set = SubjectChunkSet::new("s1", "r", vec!["a".into(), "b".into(), "c".into()]);

        assert_eq!(set.slice(1, 3).len(), 2);
        assert_eq!(set.slice(2, 10).len(), 1);
        assert!(set.slice(3, 5).is_empty());
        assert!(set.slice(7, 5).is_empty());
    }

    #[test]
    fn test_insight_is_omitted_when_absent() {
        let set = SubjectChunkSet::new("s1", "r", vec!["text".into()]);
        let json = serde_json::to_value(&set.chunks[0]).unwrap();
        assert!(json.get("insight").is_none());
    }
}
