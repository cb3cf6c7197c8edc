//! Error types for mnemo-core.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Result type alias using mnemo-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification shared by every layer of the memory stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Busy,
    Timeout,
    Invalid,
    Overloaded,
    Corrupt,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Whether a caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy | Self::Timeout | Self::Overloaded)
    }

    /// HTTP status an outer web layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::Invalid => 422,
            Self::Cancelled => 499,
            Self::Busy | Self::Overloaded => 503,
            Self::Timeout => 504,
            Self::Corrupt | Self::Internal => 500,
        }
    }

    /// Suggested retry delay in seconds for retryable errors.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Busy | Self::Timeout => Some(1),
            Self::Overloaded => Some(5),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Busy => "busy",
            Self::Timeout => "timeout",
            Self::Invalid => "invalid",
            Self::Overloaded => "overloaded",
            Self::Corrupt => "corrupt",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core error types for store, index and cache operations
#[derive(Error, Debug)]
pub enum Error {
    // Classification errors
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Store busy: {0}")]
    Busy(String),

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Store corrupt: {0}")]
    Corrupt(String),

    #[error("Operation cancelled")]
    Cancelled,

    // Database errors that carry no retry/corruption meaning
    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl Error {
    /// Create a not found error
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Invalid(_) | Self::Serialization(_) => ErrorKind::Invalid,
            Self::Corrupt(_) => ErrorKind::Corrupt,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Database(_) | Self::Io(_) | Self::Task(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        // A stored value that no longer decodes.
        if let rusqlite::Error::FromSqlConversionFailure(column, _, cause) = &err {
            return Self::Corrupt(format!("column {}: {}", column, cause));
        }
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                Self::Busy(err.to_string())
            }
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                Self::Corrupt(err.to_string())
            }
            _ => Self::Database(err),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(Error::not_found("Fact", "f-1").kind(), ErrorKind::NotFound);
        assert_eq!(Error::Busy("locked".into()).kind(), ErrorKind::Busy);
        assert_eq!(Error::invalid("bad").kind(), ErrorKind::Invalid);
        assert_eq!(Error::Corrupt("bad page".into()).kind(), ErrorKind::Corrupt);
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Busy("locked".into()).is_retryable());
        assert!(Error::Timeout { duration_ms: 10 }.is_retryable());
        assert!(!Error::invalid("dimension mismatch").is_retryable());
        assert!(!Error::Corrupt("x".into()).is_retryable());
    }

    #[test]
    fn test_sqlite_busy_is_classified() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert_eq!(Error::from(err).kind(), ErrorKind::Busy);

        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_NOTADB),
            None,
        );
        assert_eq!(Error::from(err).kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ErrorKind::Invalid.status_code(), 422);
        assert!(ErrorKind::Overloaded.status_code() >= 500);
        assert_eq!(ErrorKind::Overloaded.retry_after(), Some(5));
        assert_eq!(ErrorKind::Invalid.retry_after(), None);
    }
}
