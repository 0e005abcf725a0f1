//! Process configuration.
//!
//! Every section has defaults; [`AppConfig::from_env_or_default`] overlays
//! environment variables (after `.env` has been loaded by the binary).
//! Unparsable values are logged and ignored.

use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use quota_limiter::QuotaConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::ApiServerConfig;
use crate::generation::GenerationConfig;
use crate::notification::{WebhookAuth, WebhookConfig};
use crate::pipeline::{DeliveryConfig, TaskQueueConfig};
use crate::{Error, Result};

/// Token bucket and daily limits for the generation service.
pub type RateLimitConfig = QuotaConfig;

/// Value of `DATABASE_URL` that selects the in-memory store.
pub const MEMORY_STORE_URL: &str = "memory";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:readcast.db?mode=rwc".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn is_memory(&self) -> bool {
        self.database_url.eq_ignore_ascii_case(MEMORY_STORE_URL)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    pub max_chars_per_chunk: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            max_chars_per_chunk: text_segmenter::DEFAULT_MAX_CHARS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Without a webhook URL messages only go to the log.
    pub webhook_url: Option<String>,
    #[serde(skip_serializing)]
    pub webhook_token: Option<String>,
}

impl NotificationConfig {
    pub fn webhook(&self) -> Option<WebhookConfig> {
        let url = self.webhook_url.as_ref()?;
        Some(WebhookConfig {
            url: url.clone(),
            auth: self
                .webhook_token
                .as_ref()
                .map(|token| WebhookAuth::Bearer {
                    token: token.clone(),
                }),
            timeout_secs: 30,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Applied when a request's timezone is absent or unknown.
    pub default_timezone: String,
    pub maintenance_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_timezone: "UTC".to_string(),
            maintenance_interval_secs: 60 * 60,
        }
    }
}

impl SchedulerConfig {
    pub fn default_timezone(&self) -> Result<Tz> {
        Tz::from_str(&self.default_timezone)
            .map_err(|_| Error::config(format!("unknown timezone {}", self.default_timezone)))
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub rate_limit: RateLimitConfig,
    pub segmenter: SegmenterConfig,
    pub generation: GenerationConfig,
    pub delivery: DeliveryConfig,
    pub notification: NotificationConfig,
    pub worker_pool: TaskQueueConfig,
    pub scheduler: SchedulerConfig,
    #[serde(skip)]
    pub api: ApiServerConfig,
    pub log_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            rate_limit: RateLimitConfig::default(),
            segmenter: SegmenterConfig::default(),
            generation: GenerationConfig::default(),
            delivery: DeliveryConfig::default(),
            notification: NotificationConfig::default(),
            worker_pool: TaskQueueConfig::default(),
            scheduler: SchedulerConfig::default(),
            api: ApiServerConfig::default(),
            log_dir: "logs".to_string(),
        }
    }
}

/// Parse `key` when present, keeping `target` untouched otherwise.
fn overlay<T, F>(lookup: &F, key: &str, target: &mut T)
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return;
    }
    match raw.parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => warn!(key, value = raw, "Ignoring unparsable configuration value"),
    }
}

fn overlay_string<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl AppConfig {
    /// Load configuration from the process environment.
    ///
    /// Supported env vars:
    /// - `DATABASE_URL` (`memory` selects the in-memory store)
    /// - `RATE_LIMIT_DAILY_REQUESTS`, `RATE_LIMIT_DAILY_TOKENS`, `RATE_LIMIT_REQUEST_BURST`,
    ///   `RATE_LIMIT_REQUEST_REFILL_RATE`, `RATE_LIMIT_TOKEN_BURST`,
    ///   `RATE_LIMIT_TOKEN_REFILL_RATE`, `RATE_LIMIT_MAX_TOKENS_PER_REQUEST`,
    ///   `RATE_LIMIT_SAFETY_BUFFER`
    /// - `MAX_CHARS_PER_CHUNK`
    /// - `GENERATION_API_URL`, `GENERATION_API_KEY`, `GENERATION_MODEL`,
    ///   `GENERATION_MAX_TOKENS`, `GENERATION_SYSTEM_PROMPT`, `GENERATION_TIMEOUT_SECS`
    /// - `ESTIMATED_COMPLETION_TOKENS`
    /// - `NOTIFY_WEBHOOK_URL`, `NOTIFY_WEBHOOK_TOKEN`, `NOTIFY_MAX_ATTEMPTS`,
    ///   `NOTIFY_RETRY_DELAY_SECS`
    /// - `WORKER_MAX_CONCURRENCY`
    /// - `DEFAULT_TIMEZONE`, `MAINTENANCE_INTERVAL_SECS`
    /// - `API_BIND_ADDRESS`, `API_PORT`
    /// - `LOG_DIR`
    pub fn from_env_or_default() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env_or_default`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = overlay_string(&lookup, "DATABASE_URL") {
            config.store.database_url = url;
        }

        let rate = &mut config.rate_limit;
        overlay(&lookup, "RATE_LIMIT_DAILY_REQUESTS", &mut rate.daily_request_limit);
        overlay(&lookup, "RATE_LIMIT_DAILY_TOKENS", &mut rate.daily_token_limit);
        overlay(&lookup, "RATE_LIMIT_REQUEST_BURST", &mut rate.request_burst_capacity);
        overlay(&lookup, "RATE_LIMIT_REQUEST_REFILL_RATE", &mut rate.request_refill_rate);
        overlay(&lookup, "RATE_LIMIT_TOKEN_BURST", &mut rate.token_burst_capacity);
        overlay(&lookup, "RATE_LIMIT_TOKEN_REFILL_RATE", &mut rate.token_refill_rate);
        overlay(&lookup, "RATE_LIMIT_MAX_TOKENS_PER_REQUEST", &mut rate.max_tokens_per_request);
        overlay(&lookup, "RATE_LIMIT_SAFETY_BUFFER", &mut rate.safety_buffer);

        overlay(&lookup, "MAX_CHARS_PER_CHUNK", &mut config.segmenter.max_chars_per_chunk);

        let generation = &mut config.generation;
        if let Some(url) = overlay_string(&lookup, "GENERATION_API_URL") {
            generation.api_url = url;
        }
        generation.api_key = overlay_string(&lookup, "GENERATION_API_KEY");
        if let Some(model) = overlay_string(&lookup, "GENERATION_MODEL") {
            generation.model = model;
        }
        if let Some(prompt) = overlay_string(&lookup, "GENERATION_SYSTEM_PROMPT") {
            generation.system_prompt = prompt;
        }
        overlay(&lookup, "GENERATION_MAX_TOKENS", &mut generation.max_output_tokens);
        overlay(&lookup, "GENERATION_TIMEOUT_SECS", &mut generation.timeout_secs);
        config.delivery.max_output_tokens = config.generation.max_output_tokens;
        config.delivery.system_prompt = config.generation.system_prompt.clone();

        overlay(
            &lookup,
            "ESTIMATED_COMPLETION_TOKENS",
            &mut config.delivery.estimated_completion_tokens,
        );

        config.notification.webhook_url = overlay_string(&lookup, "NOTIFY_WEBHOOK_URL");
        config.notification.webhook_token = overlay_string(&lookup, "NOTIFY_WEBHOOK_TOKEN");
        overlay(&lookup, "NOTIFY_MAX_ATTEMPTS", &mut config.delivery.notify_max_attempts);
        let mut retry_delay_secs = config.delivery.notify_retry_delay_ms / 1000;
        overlay(&lookup, "NOTIFY_RETRY_DELAY_SECS", &mut retry_delay_secs);
        config.delivery.notify_retry_delay_ms = retry_delay_secs.saturating_mul(1000);

        overlay(&lookup, "WORKER_MAX_CONCURRENCY", &mut config.worker_pool.max_concurrency);

        if let Some(tz) = overlay_string(&lookup, "DEFAULT_TIMEZONE") {
            config.scheduler.default_timezone = tz;
        }
        overlay(
            &lookup,
            "MAINTENANCE_INTERVAL_SECS",
            &mut config.scheduler.maintenance_interval_secs,
        );

        if let Some(bind_address) = overlay_string(&lookup, "API_BIND_ADDRESS") {
            config.api.bind_address = bind_address;
        }
        overlay(&lookup, "API_PORT", &mut config.api.port);

        if let Some(log_dir) = overlay_string(&lookup, "LOG_DIR") {
            config.log_dir = log_dir;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.rate_limit.validate()?;
        if self.segmenter.max_chars_per_chunk == 0 {
            return Err(Error::config("MAX_CHARS_PER_CHUNK must be positive"));
        }
        if self.worker_pool.max_concurrency == 0 {
            return Err(Error::config("WORKER_MAX_CONCURRENCY must be positive"));
        }
        if self.delivery.notify_max_attempts == 0 {
            return Err(Error::config("NOTIFY_MAX_ATTEMPTS must be at least 1"));
        }
        if self.scheduler.maintenance_interval_secs == 0 {
            return Err(Error::config("MAINTENANCE_INTERVAL_SECS must be positive"));
        }
        self.scheduler.default_timezone()?;
        Ok(())
    }
}
