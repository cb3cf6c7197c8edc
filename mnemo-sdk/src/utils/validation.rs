//! Validation Utilities
//!
//! Checks applied at the inbound boundary before anything reaches the store.

use thiserror::Error;

use crate::SDKError;

/// Validation error types
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid user id: {0}")]
    InvalidUserId(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Field required: {0}")]
    Required(String),

    #[error("Value out of range: {0}")]
    OutOfRange(String),
}

impl From<ValidationError> for SDKError {
    fn from(err: ValidationError) -> Self {
        SDKError::invalid_operation(err.to_string())
    }
}

/// Validate a caller-supplied user id
///
/// Valid user ids are 1-128 characters with no control characters and no
/// leading or trailing whitespace.
pub fn validate_user_id(user_id: &str) -> Result<(), ValidationError> {
    if user_id.is_empty() {
        return Err(ValidationError::Required("user_id cannot be empty".into()));
    }

    if user_id.len() > 128 {
        return Err(ValidationError::InvalidUserId(
            "user_id must be 128 characters or less".into(),
        ));
    }

    if user_id.trim() != user_id {
        return Err(ValidationError::InvalidUserId(
            "user_id cannot start or end with whitespace".into(),
        ));
    }

    if let Some((i, c)) = user_id.chars().enumerate().find(|(_, c)| c.is_control()) {
        return Err(ValidationError::InvalidUserId(format!(
            "Invalid character {:?} at position {}",
            c, i
        )));
    }

    Ok(())
}

/// Validate a procedure name or mental-model key
///
/// Valid names are:
/// - 1-128 characters
/// - Lowercase alphanumeric with hyphens, underscores and dots
/// - Must start with a letter
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    let Some(first) = name.chars().next() else {
        return Err(ValidationError::Required("name cannot be empty".into()));
    };

    if name.len() > 128 {
        return Err(ValidationError::InvalidName(
            "name must be 128 characters or less".into(),
        ));
    }

    if !first.is_ascii_lowercase() {
        return Err(ValidationError::InvalidName(
            "name must start with a lowercase letter".into(),
        ));
    }

    for (i, c) in name.chars().enumerate() {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && !matches!(c, '-' | '_' | '.') {
            return Err(ValidationError::InvalidName(format!(
                "Invalid character '{}' at position {}",
                c, i
            )));
        }
    }

    Ok(())
}

/// Validate a confidence value in [0, 1]
pub fn validate_confidence(confidence: f64) -> Result<(), ValidationError> {
    if !(0.0..=1.0).contains(&confidence) {
        return Err(ValidationError::OutOfRange(format!(
            "confidence must be within [0, 1], got {}",
            confidence
        )));
    }
    Ok(())
}
