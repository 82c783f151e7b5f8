//! File system errors

use std::io::ErrorKind;
use std::path::Path;

use super::GraftError;

/// Creates a read failure for `path`, keeping permission and not-found cases distinct
pub fn read_failed(path: &Path, err: std::io::Error) -> GraftError {
    match err.kind() {
        ErrorKind::NotFound => GraftError::FileNotFound {
            path: path.display().to_string(),
        },
        ErrorKind::PermissionDenied => GraftError::PermissionDenied {
            path: path.display().to_string(),
            reason: err.to_string(),
        },
        _ => GraftError::FileReadFailed {
            path: path.display().to_string(),
            reason: err.to_string(),
        },
    }
}

/// Creates a write failure for `path`
pub fn write_failed(path: &Path, err: impl std::fmt::Display) -> GraftError {
    GraftError::FileWriteFailed {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

/// Creates an IO error with operation context
pub fn io_error(message: impl Into<String>) -> GraftError {
    GraftError::IoError {
        message: message.into(),
    }
}
