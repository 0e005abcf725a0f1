//! Token estimation.
//!
//! Estimates are only used for pre-flight reservation; the daily counters are
//! always driven by the usage the upstream service reports.

/// Estimates the prompt-side token cost of a text.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u64;
}

impl<F> TokenEstimator for F
where
    F: Fn(&str) -> u64 + Send + Sync,
{
    fn estimate(&self, text: &str) -> u64 {
        self(text)
    }
}

/// `max(1, chars / chars_per_token) + fixed_overhead`.
///
/// The overhead accounts for the system prompt and message framing.
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    pub chars_per_token: u64,
    pub fixed_overhead: u64,
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: 4,
            fixed_overhead: 30,
        }
    }
}

impl CharRatioEstimator {
    /// Estimate from a character count instead of a text.
    pub fn estimate_chars(&self, chars: u64) -> u64 {
        (chars / self.chars_per_token.max(1)).max(1) + self.fixed_overhead
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> u64 {
        self.estimate_chars(text.chars().count() as u64)
    }
}
