//! Rate limiting primitives for quota-constrained upstream services.
//!
//! Two layers are provided:
//!
//! - [`TokenBucket`]: a burst limiter for any quantity (requests, tokens).
//! - [`QuotaManager`]: two buckets (request count and token count) combined
//!   with daily caps that reset at UTC midnight, plus usage history.
//!
//! Burst buckets are reserved before an upstream call through
//! [`QuotaManager::acquire`]; daily counters only move when the real usage is
//! reported through [`QuotaManager::record_actual_usage`].

mod bucket;
mod clock;
mod error;
mod estimator;
mod quota;

pub use bucket::{BucketConfig, BucketSnapshot, TokenBucket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::QuotaError;
pub use estimator::{CharRatioEstimator, TokenEstimator};
pub use quota::{
    BurstStats, DenialReason, EstimationAccuracy, QuotaConfig, QuotaDecision, QuotaManager,
    Recommendation, Usage, UsageRecord, UsageStats,
};
