//! OpenAI-compatible chat-completions client.

use std::time::Duration;

use async_trait::async_trait;
use quota_limiter::Usage;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{DEFAULT_SYSTEM_PROMPT, Generation, GenerationError, GenerationService};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Full URL of the chat-completions endpoint.
    pub api_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub max_output_tokens: u32,
    pub system_prompt: String,
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.groq.com/openai/v1/chat/completions".to_string(),
            api_key: None,
            model: "openai/gpt-oss-120b".to_string(),
            max_output_tokens: 1400,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            timeout_secs: 60,
        }
    }
}

pub struct ChatCompletionsClient {
    config: GenerationConfig,
    client: Client,
}

impl ChatCompletionsClient {
    pub fn new(config: GenerationConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self { config, client }
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    fn build_payload(&self, text: &str, system_prompt: &str, max_output_tokens: u32) -> serde_json::Value {
        json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": text },
            ],
            "max_tokens": max_output_tokens,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    total_tokens: u64,
}

fn parse_response(body: &str, fallback_model: &str) -> Result<Generation, GenerationError> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;

    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| GenerationError::InvalidResponse("no content returned".to_string()))?;

    let usage = response
        .usage
        .ok_or_else(|| GenerationError::InvalidResponse("usage data unavailable".to_string()))?;

    Ok(Generation {
        content,
        usage: Usage {
            total_tokens: usage.total_tokens,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        },
        model: response.model.unwrap_or_else(|| fallback_model.to_string()),
    })
}

#[async_trait]
impl GenerationService for ChatCompletionsClient {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn generate(
        &self,
        text: &str,
        system_prompt: &str,
        max_output_tokens: u32,
    ) -> Result<Generation, GenerationError> {
        let api_key = self.config.api_key.as_deref().ok_or_else(|| {
            GenerationError::Unavailable("no generation API key configured".to_string())
        })?;

        let payload = self.build_payload(text, system_prompt, max_output_tokens);
        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| GenerationError::Unavailable(format!("request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(model = %self.config.model, "Generation service rate limited the request");
            return Err(GenerationError::RateLimited {
                status: status.as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| GenerationError::Unavailable(format!("failed to read body: {e}")))?;

        if !status.is_success() {
            return Err(GenerationError::Unavailable(format!("HTTP {status}: {body}")));
        }

        let generation = parse_response(&body, &self.config.model)?;
        debug!(
            model = %generation.model,
            total_tokens = generation.usage.total_tokens,
            "Generation completed"
        );
        Ok(generation)
    }
}
