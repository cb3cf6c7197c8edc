//! SDK Utilities
//!
//! Common utilities for the SDK.

mod hashing;
mod validation;

pub use hashing::{content_hash, hash64, normalized_hash};
pub use validation::{validate_confidence, validate_name, validate_user_id, ValidationError};
