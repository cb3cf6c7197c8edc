//! Exit codes for the mnemo CLI.
//!
//! Store errors keep their kind all the way out so scripts can tell a
//! corrupt store from a busy one.

use mnemo_sdk::{ErrorKind, SDKError};

pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_NOT_FOUND: i32 = 2;
pub const EXIT_INVALID: i32 = 3;
pub const EXIT_BUSY: i32 = 4;
pub const EXIT_CORRUPT: i32 = 5;

fn sdk_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<SDKError>())
        .map(SDKError::kind)
}

/// Process exit code for a failed command.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    match sdk_kind(err) {
        Some(ErrorKind::NotFound) => EXIT_NOT_FOUND,
        Some(ErrorKind::Invalid) => EXIT_INVALID,
        Some(ErrorKind::Busy | ErrorKind::Timeout | ErrorKind::Overloaded | ErrorKind::Cancelled) => EXIT_BUSY,
        Some(ErrorKind::Corrupt) => EXIT_CORRUPT,
        Some(ErrorKind::Internal) | None => EXIT_FAILURE,
    }
}

/// One-line suggestion printed under the error.
pub fn hint(err: &anyhow::Error) -> Option<&'static str> {
    match sdk_kind(err)? {
        ErrorKind::Corrupt => Some("Restore a snapshot: mnemo backup --list, then mnemo restore <path>"),
        ErrorKind::Busy | ErrorKind::Overloaded => Some("Another process holds the store; retry shortly"),
        ErrorKind::Timeout => Some("Raise --timeout-ms or controller.default_timeout_ms"),
        _ => None,
    }
}
