//! Load command editing errors

use super::GraftError;

/// Creates a malformed binary error
pub fn malformed(reason: impl Into<String>) -> GraftError {
    GraftError::MalformedBinary {
        reason: reason.into(),
    }
}

/// Creates an already-present error for a dylib reference
pub fn already_present(reference: &str) -> GraftError {
    GraftError::AlreadyPresent {
        reference: reference.to_string(),
    }
}

/// Creates a not-present error for a dylib reference
pub fn not_present(reference: &str) -> GraftError {
    GraftError::NotPresent {
        reference: reference.to_string(),
    }
}
