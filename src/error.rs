use thiserror::Error;

/// Main error type for the ledger engine
#[derive(Error, Debug)]
pub enum TallyError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors (connectivity / integrity)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Unique constraint violation on create (duplicate order id or slice)
    #[error("Conflict: {0}")]
    Conflict(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Broker errors
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Invalid broker payload: {0}")]
    InvalidBrokerPayload(String),

    // A safety dependency the submission path needs is unavailable
    #[error("Infrastructure failure: {0}")]
    Infrastructure(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TallyError {
    /// True for connectivity/integrity failures of the ledger store
    pub fn is_store_error(&self) -> bool {
        matches!(self, TallyError::Database(_))
    }

    /// Map a sqlx error, turning unique-constraint violations into `Conflict`
    /// and dangling parent references into `Validation`
    pub fn from_insert(err: sqlx::Error, what: impl Into<String>) -> Self {
        let code = err
            .as_database_error()
            .and_then(|db| db.code())
            .map(|code| code.into_owned());

        match code.as_deref() {
            Some("23505") => TallyError::Conflict(what.into()),
            Some("23503") => {
                TallyError::Validation(format!("{}: referenced parent does not exist", what.into()))
            }
            _ => TallyError::Database(err),
        }
    }
}

/// Result type alias for TallyError
pub type Result<T> = std::result::Result<T, TallyError>;

/// Errors surfaced by the broker client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Network failure, timeout, 429 or 5xx: safe to retry before acceptance
    #[error("connection error: {0}")]
    Connection(String),

    /// Request rejected as malformed (422 and friends)
    #[error("validation error: {0}")]
    Validation(String),

    /// Request understood but refused (buying power, halted symbol, auth)
    #[error("rejected: {0}")]
    Rejection(String),

    /// Broker answered with something we cannot interpret
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl BrokerError {
    /// Only connection-class failures are retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Connection(_))
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BrokerError::InvalidResponse(err.to_string())
        } else {
            BrokerError::Connection(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_errors_retry() {
        assert!(BrokerError::Connection("reset".into()).is_retryable());
        assert!(!BrokerError::Validation("qty".into()).is_retryable());
        assert!(!BrokerError::Rejection("buying power".into()).is_retryable());
        assert!(!BrokerError::InvalidResponse("eof".into()).is_retryable());
    }

    #[test]
    fn test_non_database_errors_are_not_store_errors() {
        assert!(TallyError::Database(sqlx::Error::PoolTimedOut).is_store_error());
        assert!(!TallyError::Conflict("dup".into()).is_store_error());
    }

    #[test]
    fn test_plain_sqlx_error_is_not_conflict() {
        let err = TallyError::from_insert(sqlx::Error::PoolTimedOut, "order abc");
        assert!(matches!(err, TallyError::Database(_)));
    }
}
