//! Health reporting and scheduling audit records.

pub mod health;
pub mod scheduling;

pub use health::{ComponentHealth, HealthStatus, SystemHealth};
pub use scheduling::{MetricRecord, SchedulingMetrics};
