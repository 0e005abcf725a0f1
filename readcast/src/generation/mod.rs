//! Upstream text-generation service.

mod chat;

pub use chat::{ChatCompletionsClient, GenerationConfig};

use async_trait::async_trait;
use quota_limiter::Usage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SYSTEM_PROMPT: &str = "Given some text, elaborate and explain it without jargon. \
If applicable, recommend concepts to brush up on and additional resources for comprehensive \
understanding. Complete the response within the max token limit.";

/// Content produced for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub content: String,
    pub usage: Usage,
    pub model: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// Upstream throttled the call. Displayed the way it is recorded per chunk.
    #[error("HTTP {status}")]
    RateLimited { status: u16 },

    #[error("generation service unavailable: {0}")]
    Unavailable(String),

    #[error("invalid generation response: {0}")]
    InvalidResponse(String),
}

impl GenerationError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

#[async_trait]
pub trait GenerationService: Send + Sync {
    fn model(&self) -> &str;

    async fn generate(
        &self,
        text: &str,
        system_prompt: &str,
        max_output_tokens: u32,
    ) -> Result<Generation, GenerationError>;
}
