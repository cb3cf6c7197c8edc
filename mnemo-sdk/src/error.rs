//! SDK Error Types
//!
//! Store, index and cache errors pass through unchanged as [`SDKError::Core`];
//! the SDK adds the controller and configuration failures on top.

use mnemo_core::ErrorKind;
use thiserror::Error;

/// SDK Result type alias
pub type SDKResult<T> = Result<T, SDKError>;

/// SDK errors
#[derive(Debug, Error)]
pub enum SDKError {
    /// Error raised by the store, index or cache
    #[error(transparent)]
    Core(#[from] mnemo_core::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigValidationError),

    /// Controller queue is full
    #[error("overloaded: {class} queue is full ({capacity} slots)")]
    Overloaded { class: String, capacity: usize },

    /// Caller-supplied deadline elapsed
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Embedder failed to produce a vector
    #[error("embedding error: {message}")]
    Embedding { message: String },

    /// Entry not found
    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: String, id: String },

    /// Invalid operation
    #[error("invalid operation: {message}")]
    InvalidOperation { message: String },

    /// Operation cancelled by its owner
    #[error("operation cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SDKError {
    /// Create an embedding error
    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Create an invalid operation error
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create an overloaded error
    pub fn overloaded(class: impl Into<String>, capacity: usize) -> Self {
        Self::Overloaded {
            class: class.into(),
            capacity,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Core(err) => err.kind(),
            Self::Config(_) | Self::InvalidOperation { .. } | Self::Serialization(_) => {
                ErrorKind::Invalid
            }
            Self::Overloaded { .. } => ErrorKind::Overloaded,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Embedding { .. } | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Check if this error is a not found error
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Check if this error is a timeout error
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// HTTP status for an outer web layer.
    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }

    /// Retry hint in seconds for an outer web layer.
    pub fn retry_after(&self) -> Option<u64> {
        self.kind().retry_after()
    }
}
