//! Daily quota accounting on top of two burst buckets.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Days, NaiveTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bucket::{BucketConfig, BucketSnapshot, TokenBucket};
use crate::clock::{Clock, SystemClock};
use crate::error::QuotaError;
use crate::estimator::{CharRatioEstimator, TokenEstimator};

/// Number of usage records kept in memory.
const DEFAULT_HISTORY_LIMIT: usize = 1000;
/// Number of recent records used for accuracy analysis.
const ACCURACY_WINDOW: usize = 100;
/// Average relative error above which the safety buffer should grow.
const ACCURACY_THRESHOLD: f64 = 0.2;

/// Limits for one upstream service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub daily_request_limit: u64,
    pub daily_token_limit: u64,
    pub request_burst_capacity: u64,
    /// Requests per second.
    pub request_refill_rate: f64,
    pub token_burst_capacity: u64,
    /// Tokens per second.
    pub token_refill_rate: f64,
    /// Upper bound on a single request's tokens, advertised to callers.
    pub max_tokens_per_request: u64,
    /// Fraction added on top of every estimate, e.g. `0.1` for 10%.
    pub safety_buffer: f64,
    pub history_limit: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_request_limit: 1000,
            daily_token_limit: 200_000,
            request_burst_capacity: 5,
            request_refill_rate: 0.5,
            token_burst_capacity: 8000,
            token_refill_rate: 1000.0,
            max_tokens_per_request: 1700,
            safety_buffer: 0.1,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl QuotaConfig {
    pub fn validate(&self) -> Result<(), QuotaError> {
        self.request_bucket().validate()?;
        self.token_bucket().validate()?;
        if !self.safety_buffer.is_finite() || self.safety_buffer < 0.0 {
            return Err(QuotaError::invalid(format!(
                "safety buffer must be a non-negative finite number, got {}",
                self.safety_buffer
            )));
        }
        if self.history_limit == 0 {
            return Err(QuotaError::invalid("history limit must be at least 1"));
        }
        Ok(())
    }

    fn request_bucket(&self) -> BucketConfig {
        BucketConfig::new(self.request_burst_capacity, self.request_refill_rate)
    }

    fn token_bucket(&self) -> BucketConfig {
        BucketConfig::new(self.token_burst_capacity, self.token_refill_rate)
    }
}

/// Why a request was refused, in the order the checks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    DailyRequestLimitExceeded,
    DailyTokenLimitExceeded,
    RequestRateLimitExceeded,
    TokenRateLimitExceeded,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DailyRequestLimitExceeded => "daily_request_limit_exceeded",
            Self::DailyTokenLimitExceeded => "daily_token_limit_exceeded",
            Self::RequestRateLimitExceeded => "request_rate_limit_exceeded",
            Self::TokenRateLimitExceeded => "token_rate_limit_exceeded",
        }
    }

    /// Daily denials will not clear until the next UTC midnight.
    pub fn is_daily(&self) -> bool {
        matches!(
            self,
            Self::DailyRequestLimitExceeded | Self::DailyTokenLimitExceeded
        )
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a pre-flight check.
///
/// `estimated` and `buffered` are filled in for denials as well, so callers can
/// log the cost that was refused.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub reason: Option<DenialReason>,
    pub estimated: u64,
    pub buffered: u64,
}

/// Token usage reported by the upstream service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub total_tokens: u64,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    pub chunk_length: u64,
    pub estimated_tokens: u64,
    pub total_tokens: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub model: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageStats {
    pub daily_requests_used: u64,
    pub daily_tokens_used: u64,
    pub daily_requests_remaining: u64,
    pub daily_tokens_remaining: u64,
    pub total_recorded_requests: usize,
    pub next_daily_reset: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BurstStats {
    pub requests: BucketSnapshot,
    pub tokens: BucketSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    IncreaseBuffer,
    BufferAdequate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EstimationAccuracy {
    pub average_error: f64,
    pub max_error: f64,
    pub sample_size: usize,
    pub recommendation: Recommendation,
}

#[derive(Debug)]
struct DailyState {
    requests_used: u64,
    tokens_used: u64,
    reset_at: DateTime<Utc>,
    history: VecDeque<UsageRecord>,
}

/// Request and token limiter for one upstream service.
///
/// All counters live behind this type's own locks; callers only interact
/// through the methods below.
pub struct QuotaManager {
    config: QuotaConfig,
    request_bucket: TokenBucket,
    token_bucket: TokenBucket,
    daily: Mutex<DailyState>,
    estimator: Arc<dyn TokenEstimator>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for QuotaManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaManager")
            .field("config", &self.config)
            .field("request_bucket", &self.request_bucket)
            .field("token_bucket", &self.token_bucket)
            .finish_non_exhaustive()
    }
}

impl QuotaManager {
    pub fn new(config: QuotaConfig) -> Result<Self, QuotaError> {
        Self::builder(config).build()
    }

    pub fn builder(config: QuotaConfig) -> QuotaManagerBuilder {
        QuotaManagerBuilder {
            config,
            estimator: None,
            clock: None,
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Concurrency ceiling for fan-out callers.
    pub fn request_burst_capacity(&self) -> u64 {
        self.config.request_burst_capacity
    }

    pub fn estimate(&self, text: &str) -> u64 {
        self.estimator.estimate(text)
    }

    /// Check whether a request for `text` could run now, without reserving.
    pub fn can_process(&self, text: &str, estimated_completion: u64) -> QuotaDecision {
        let estimated = self.estimate(text) + estimated_completion;
        let buffered = (estimated as f64 * (1.0 + self.config.safety_buffer)).ceil() as u64;

        let deny = |reason| QuotaDecision {
            allowed: false,
            reason: Some(reason),
            estimated,
            buffered,
        };

        {
            let mut daily = self.daily.lock();
            self.reset_if_due(&mut daily);

            if daily.requests_used >= self.config.daily_request_limit {
                return deny(DenialReason::DailyRequestLimitExceeded);
            }
            if daily.tokens_used.saturating_add(buffered) > self.config.daily_token_limit {
                return deny(DenialReason::DailyTokenLimitExceeded);
            }
        }

        if !self.request_bucket.has_capacity(1) {
            return deny(DenialReason::RequestRateLimitExceeded);
        }
        if !self.token_bucket.has_capacity(buffered) {
            return deny(DenialReason::TokenRateLimitExceeded);
        }

        QuotaDecision {
            allowed: true,
            reason: None,
            estimated,
            buffered,
        }
    }

    /// Reserve burst capacity for one request.
    ///
    /// Daily counters are not touched here. A `false` return after a passing
    /// check means another caller won the race for the bucket and should be
    /// treated like any other temporary denial.
    pub fn acquire(&self, text: &str, estimated_completion: u64) -> bool {
        let decision = self.can_process(text, estimated_completion);
        if !decision.allowed {
            return false;
        }

        let request_acquired = self.request_bucket.consume(1);
        let tokens_acquired = request_acquired && self.token_bucket.consume(decision.buffered);

        if !tokens_acquired {
            debug!(
                buffered = decision.buffered,
                request_acquired, "lost bucket race after successful check"
            );
        }
        tokens_acquired
    }

    /// Account for a completed request using the usage the upstream reported.
    pub fn record_actual_usage(&self, usage: Usage, text: &str, model: &str) {
        let record = UsageRecord {
            chunk_length: text.chars().count() as u64,
            estimated_tokens: self.estimate(text),
            total_tokens: usage.total_tokens,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            model: model.to_string(),
            recorded_at: self.clock.now(),
        };

        let mut daily = self.daily.lock();
        self.reset_if_due(&mut daily);

        daily.requests_used += 1;
        daily.tokens_used = daily.tokens_used.saturating_add(usage.total_tokens);
        daily.history.push_back(record);
        while daily.history.len() > self.config.history_limit {
            daily.history.pop_front();
        }

        debug!(
            total_tokens = usage.total_tokens,
            daily_requests_used = daily.requests_used,
            daily_tokens_used = daily.tokens_used,
            "recorded upstream usage"
        );
    }

    /// Daily usage as of now. Counters past their reset boundary read as zero.
    pub fn stats(&self) -> UsageStats {
        let now = self.clock.now();
        let daily = self.daily.lock();

        let (requests_used, tokens_used, next_daily_reset) = if now >= daily.reset_at {
            (0, 0, next_utc_midnight(now))
        } else {
            (daily.requests_used, daily.tokens_used, daily.reset_at)
        };

        UsageStats {
            daily_requests_used: requests_used,
            daily_tokens_used: tokens_used,
            daily_requests_remaining: self.config.daily_request_limit.saturating_sub(requests_used),
            daily_tokens_remaining: self.config.daily_token_limit.saturating_sub(tokens_used),
            total_recorded_requests: daily.history.len(),
            next_daily_reset,
        }
    }

    pub fn burst_stats(&self) -> BurstStats {
        BurstStats {
            requests: self.request_bucket.snapshot(),
            tokens: self.token_bucket.snapshot(),
        }
    }

    /// Newest records first.
    pub fn recent_usage(&self, limit: usize) -> Vec<UsageRecord> {
        self.daily
            .lock()
            .history
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Compare prompt estimates against reported totals for recent requests.
    ///
    /// Returns `None` until at least one usage record exists.
    pub fn estimation_accuracy(&self) -> Option<EstimationAccuracy> {
        let daily = self.daily.lock();
        if daily.history.is_empty() {
            return None;
        }

        let errors: Vec<f64> = daily
            .history
            .iter()
            .rev()
            .take(ACCURACY_WINDOW)
            .map(|record| {
                if record.total_tokens == 0 {
                    0.0
                } else {
                    (record.estimated_tokens as f64 - record.total_tokens as f64).abs()
                        / record.total_tokens as f64
                }
            })
            .collect();

        let average_error = errors.iter().sum::<f64>() / errors.len() as f64;
        let max_error = errors.iter().copied().fold(0.0, f64::max);

        Some(EstimationAccuracy {
            average_error,
            max_error,
            sample_size: errors.len(),
            recommendation: if average_error > ACCURACY_THRESHOLD {
                Recommendation::IncreaseBuffer
            } else {
                Recommendation::BufferAdequate
            },
        })
    }

    fn reset_if_due(&self, daily: &mut DailyState) {
        let now = self.clock.now();
        if now >= daily.reset_at {
            info!(
                requests_used = daily.requests_used,
                tokens_used = daily.tokens_used,
                "resetting daily quota counters"
            );
            daily.requests_used = 0;
            daily.tokens_used = 0;
            daily.reset_at = next_utc_midnight(now);
        }
    }
}

pub struct QuotaManagerBuilder {
    config: QuotaConfig,
    estimator: Option<Arc<dyn TokenEstimator>>,
    clock: Option<Arc<dyn Clock>>,
}

impl QuotaManagerBuilder {
    pub fn estimator(mut self, estimator: impl TokenEstimator + 'static) -> Self {
        self.estimator = Some(Arc::new(estimator));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<QuotaManager, QuotaError> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let estimator = self
            .estimator
            .unwrap_or_else(|| Arc::new(CharRatioEstimator::default()));

        let request_bucket = TokenBucket::with_clock(self.config.request_bucket(), clock.clone())?;
        let token_bucket = TokenBucket::with_clock(self.config.token_bucket(), clock.clone())?;
        let reset_at = next_utc_midnight(clock.now());

        Ok(QuotaManager {
            config: self.config,
            request_bucket,
            token_bucket,
            daily: Mutex::new(DailyState {
                requests_used: 0,
                tokens_used: 0,
                reset_at,
                history: VecDeque::new(),
            }),
            estimator,
            clock,
        })
    }
}

fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    let tomorrow = today.checked_add_days(Days::new(1)).unwrap_or(today);
    tomorrow.and_time(NaiveTime::default()).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::time::Duration;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 22, 0, 0).unwrap()
    }

    fn manager(config: QuotaConfig) -> (QuotaManager, ManualClock) {
        let clock = ManualClock::new(start());
        let manager = QuotaManager::builder(config)
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        (manager, clock)
    }

    fn usage(total: u64) -> Usage {
        Usage {
            total_tokens: total,
            prompt_tokens: total / 2,
            completion_tokens: total - total / 2,
        }
    }

    #[test]
    fn test_buffered_is_ceiled() {
        let (manager, _clock) = manager(QuotaConfig::default());
        // 4 chars -> 1 + 30 = 31; 31 + 500 = 531; 531 * 1.1 = 584.1 -> 585
        let decision = manager.can_process("abcd", 500);
        assert!(decision.allowed);
        assert_eq!(decision.estimated, 531);
        assert_eq!(decision.buffered, 585);
    }

    #[test]
    fn test_daily_token_limit_denial() {
        let fixed = |_: &str| 1000u64;
        let manager = QuotaManager::builder(QuotaConfig {
            daily_token_limit: 1000,
            ..Default::default()
        })
        .estimator(fixed)
        .build()
        .unwrap();

        let decision = manager.can_process("anything", 0);
        assert!(!decision.allowed);
        assert_eq!(decision.buffered, 1100);
        assert_eq!(decision.reason, Some(DenialReason::DailyTokenLimitExceeded));
        assert_eq!(
            decision.reason.map(|r| r.to_string()).as_deref(),
            Some("daily_token_limit_exceeded")
        );
    }

    #[test]
    fn test_daily_request_limit_blocks_acquire() {
        let (manager, _clock) = manager(QuotaConfig {
            daily_request_limit: 2,
            ..Default::default()
        });

        manager.record_actual_usage(usage(10), "a", "m");
        assert!(manager.acquire("a", 0));
        manager.record_actual_usage(usage(10), "a", "m");

        let decision = manager.can_process("a", 0);
        assert_eq!(decision.reason, Some(DenialReason::DailyRequestLimitExceeded));
        assert!(!manager.acquire("a", 0));
    }

    #[test]
    fn test_daily_check_precedes_burst_check() {
        let (manager, _clock) = manager(QuotaConfig {
            daily_request_limit: 1,
            request_burst_capacity: 1,
            request_refill_rate: 0.0,
            ..Default::default()
        });
        assert!(manager.acquire("a", 0));
        manager.record_actual_usage(usage(5), "a", "m");

        assert_eq!(
            manager.can_process("a", 0).reason,
            Some(DenialReason::DailyRequestLimitExceeded)
        );
    }

    #[test]
    fn test_acquire_does_not_touch_daily_counters() {
        let (manager, _clock) = manager(QuotaConfig::default());
        assert!(manager.acquire("hello world", 500));
        assert!(manager.acquire("hello world", 500));

        let stats = manager.stats();
        assert_eq!(stats.daily_requests_used, 0);
        assert_eq!(stats.daily_tokens_used, 0);
    }

    #[test]
    fn test_record_uses_actual_not_estimate() {
        let (manager, _clock) = manager(QuotaConfig::default());
        assert!(manager.acquire(&"x".repeat(4000), 500));
        manager.record_actual_usage(usage(777), &"x".repeat(4000), "model-a");

        let stats = manager.stats();
        assert_eq!(stats.daily_requests_used, 1);
        assert_eq!(stats.daily_tokens_used, 777);
        assert_eq!(stats.daily_tokens_remaining, 200_000 - 777);
        assert_eq!(stats.total_recorded_requests, 1);
    }

    #[test]
    fn test_request_rate_limit_denial() {
        let (manager, _clock) = manager(QuotaConfig {
            request_burst_capacity: 2,
            request_refill_rate: 0.0,
            ..Default::default()
        });
        assert!(manager.acquire("a", 0));
        assert!(manager.acquire("a", 0));
        assert_eq!(
            manager.can_process("a", 0).reason,
            Some(DenialReason::RequestRateLimitExceeded)
        );
    }

    #[test]
    fn test_token_rate_limit_denial_and_refill() {
        let (manager, clock) = manager(QuotaConfig {
            token_burst_capacity: 100,
            token_refill_rate: 10.0,
            ..Default::default()
        });
        // 31 estimated -> 35 buffered
        assert!(manager.acquire("abcd", 0));
        assert!(manager.acquire("abcd", 0));
        assert_eq!(
            manager.can_process("abcd", 0).reason,
            Some(DenialReason::TokenRateLimitExceeded)
        );

        clock.advance(Duration::from_secs(5));
        assert!(manager.can_process("abcd", 0).allowed);
    }

    #[test]
    fn test_daily_reset_at_utc_midnight() {
        let (manager, clock) = manager(QuotaConfig::default());
        manager.record_actual_usage(usage(500), "a", "m");
        assert_eq!(
            manager.stats().next_daily_reset,
            Utc.with_ymd_and_hms(2024, 5, 11, 0, 0, 0).unwrap()
        );

        clock.advance(Duration::from_secs(3600));
        assert_eq!(manager.stats().daily_tokens_used, 500);

        clock.advance(Duration::from_secs(3600));
        manager.can_process("a", 0);
        let stats = manager.stats();
        assert_eq!(stats.daily_tokens_used, 0);
        assert_eq!(stats.daily_requests_used, 0);
        assert_eq!(
            stats.next_daily_reset,
            Utc.with_ymd_and_hms(2024, 5, 12, 0, 0, 0).unwrap()
        );
        // History survives the reset.
        assert_eq!(stats.total_recorded_requests, 1);
    }

    #[test]
    fn test_reset_happens_once_across_several_days() {
        let (manager, clock) = manager(QuotaConfig::default());
        manager.record_actual_usage(usage(100), "a", "m");

        clock.advance(Duration::from_secs(3 * 86_400));
        manager.record_actual_usage(usage(40), "a", "m");

        let stats = manager.stats();
        assert_eq!(stats.daily_tokens_used, 40);
        assert_eq!(stats.daily_requests_used, 1);
        assert_eq!(
            stats.next_daily_reset,
            Utc.with_ymd_and_hms(2024, 5, 14, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_history_keeps_newest_records() {
        let (manager, _clock) = manager(QuotaConfig {
            history_limit: 3,
            ..Default::default()
        });
        for total in 1..=5 {
            manager.record_actual_usage(usage(total), "a", "m");
        }

        let recent: Vec<u64> = manager.recent_usage(10).iter().map(|r| r.total_tokens).collect();
        assert_eq!(recent, vec![5, 4, 3]);
        assert_eq!(manager.stats().daily_requests_used, 5);
    }

    #[test]
    fn test_estimation_accuracy() {
        let (manager, _clock) = manager(QuotaConfig::default());
        assert!(manager.estimation_accuracy().is_none());

        // 400 chars -> estimate 130
        let text = "y".repeat(400);
        manager.record_actual_usage(usage(130), &text, "m");
        let accuracy = manager.estimation_accuracy().unwrap();
        assert_eq!(accuracy.sample_size, 1);
        assert_eq!(accuracy.average_error, 0.0);
        assert_eq!(accuracy.recommendation, Recommendation::BufferAdequate);

        manager.record_actual_usage(usage(65), &text, "m");
        let accuracy = manager.estimation_accuracy().unwrap();
        assert_eq!(accuracy.max_error, 1.0);
        assert_eq!(accuracy.recommendation, Recommendation::IncreaseBuffer);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(
            QuotaManager::new(QuotaConfig {
                safety_buffer: -0.5,
                ..Default::default()
            })
            .is_err()
        );
        assert!(
            QuotaManager::new(QuotaConfig {
                request_burst_capacity: 0,
                ..Default::default()
            })
            .is_err()
        );
    }

    #[test]
    fn test_denial_reason_serde() {
        let json = serde_json::to_string(&DenialReason::TokenRateLimitExceeded).unwrap();
        assert_eq!(json, "\"token_rate_limit_exceeded\"");
        assert!(DenialReason::DailyTokenLimitExceeded.is_daily());
        assert!(!DenialReason::RequestRateLimitExceeded.is_daily());
    }
}
