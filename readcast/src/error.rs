//! Application-wide error types.

use quota_limiter::DenialReason;
use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid schedule data: {0}")]
    InvalidSchedule(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Quota denied: {0}")]
    QuotaDenied(DenialReason),

    #[error("Store unavailable: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Notification transport error: {0}")]
    Transport(String),

    /// The message went out but the delivery marker could not be written.
    #[error("Delivery marker write failed after send: {0}")]
    MarkerWrite(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_schedule(msg: impl Into<String>) -> Self {
        Self::InvalidSchedule(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Infrastructure failures worth retrying at the boundary that issued the call.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(_) | Self::Transport(_) => true,
            Self::DatabaseSqlx(err) => matches!(
                err,
                sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Io(_)
                    | sqlx::Error::WorkerCrashed
            ) || is_sqlite_busy(err),
            _ => false,
        }
    }

    /// Rejected input that must never be retried.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidSchedule(_) | Self::Validation(_))
    }
}

impl From<quota_limiter::QuotaError> for Error {
    fn from(err: quota_limiter::QuotaError) -> Self {
        Self::Configuration(err.to_string())
    }
}

pub(crate) fn is_sqlite_busy(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = err else {
        let msg = err.to_string().to_ascii_lowercase();
        return msg.contains("database is locked") || msg.contains("database is busy");
    };

    if matches!(db_err.code().as_deref(), Some("5") | Some("6")) {
        return true;
    }

    let msg = db_err.message().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::store("connection refused").is_transient());
        assert!(Error::transport("timeout").is_transient());
        assert!(Error::DatabaseSqlx(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!Error::validation("bad").is_transient());
        assert!(!Error::MarkerWrite("gone".into()).is_transient());
        assert!(!Error::Generation("boom".into()).is_transient());
    }

    #[test]
    fn test_validation_classification() {
        assert!(Error::invalid_schedule("bad time").is_validation());
        assert!(!Error::QuotaDenied(DenialReason::DailyTokenLimitExceeded).is_validation());
    }
}
