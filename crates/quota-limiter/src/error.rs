use thiserror::Error;

/// Errors raised while building limiters.
///
/// Denials are not errors; they are reported through
/// [`QuotaDecision`](crate::QuotaDecision).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuotaError {
    #[error("Invalid limiter configuration: {0}")]
    InvalidConfig(String),
}

impl QuotaError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
