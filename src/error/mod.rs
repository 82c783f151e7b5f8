//! Error types and handling for Graft
//!
//! Uses `thiserror` for error definitions and `miette` for pretty diagnostics.
//!
//! Sub-modules hold convenience constructors by error domain:
//! - [`fs`]: File system errors
//! - [`patch`]: Load command editing errors

pub mod fs;
pub mod patch;

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Main error type for Graft operations
#[derive(Error, Diagnostic, Debug)]
pub enum GraftError {
    // Lookup errors
    #[error("Application '{id}' not found")]
    #[diagnostic(
        code(graft::app::not_found),
        help("Run 'graft list' to see installed applications")
    )]
    ApplicationNotFound { id: String },

    #[error("Module not found: {path}")]
    #[diagnostic(code(graft::module::not_found))]
    ModuleNotFound { path: String },

    // Eligibility errors
    #[error("Permission denied: {path}: {reason}")]
    #[diagnostic(code(graft::app::permission_denied))]
    PermissionDenied { path: String, reason: String },

    #[error("Application '{id}' is not eligible for injection: {reason}")]
    #[diagnostic(code(graft::app::ineligible))]
    Ineligible { id: String, reason: String },

    // Structure errors
    #[error("Invalid application bundle at {path}: {reason}")]
    #[diagnostic(code(graft::bundle::invalid))]
    InvalidBundle { path: String, reason: String },

    #[error("Invalid module {path}: {reason}")]
    #[diagnostic(
        code(graft::module::invalid),
        help("Modules must be a .dylib file, a .framework bundle or a .bundle directory")
    )]
    InvalidModule { path: String, reason: String },

    #[error("Attached modules of '{id}' do not match its executable: {detail}")]
    #[diagnostic(
        code(graft::bundle::integrity_mismatch),
        help("Run 'graft verify <app>' for details, or reinstall the application to reset it")
    )]
    IntegrityMismatch { id: String, detail: String },

    #[error("Content hash mismatch for module '{name}'")]
    #[diagnostic(code(graft::module::hash_mismatch))]
    HashMismatch { name: String },

    // Binary patching errors
    #[error("Malformed Mach-O: {reason}")]
    #[diagnostic(code(graft::patch::malformed))]
    MalformedBinary { reason: String },

    #[error("Unsupported architecture slice (cputype {cputype:#x})")]
    #[diagnostic(code(graft::patch::unsupported_architecture))]
    UnsupportedArchitecture { cputype: u32 },

    #[error("Not enough space for a new load command: need {needed} bytes, {available} available")]
    #[diagnostic(
        code(graft::patch::capacity_exceeded),
        help("The executable has no free header padding left for another load command")
    )]
    CapacityExceeded { needed: usize, available: usize },

    #[error("Load command for '{reference}' is already present")]
    #[diagnostic(code(graft::patch::already_present))]
    AlreadyPresent { reference: String },

    #[error("Load command for '{reference}' is not present")]
    #[diagnostic(code(graft::patch::not_present))]
    NotPresent { reference: String },

    // Module store errors
    #[error("Module '{module}' is already attached to '{id}'")]
    #[diagnostic(code(graft::store::already_attached))]
    AlreadyAttached { id: String, module: String },

    #[error("Module '{module}' is not attached to '{id}'")]
    #[diagnostic(
        code(graft::store::not_attached),
        help("Run 'graft view <app>' to see attached modules")
    )]
    NotAttached { id: String, module: String },

    // File system errors
    #[error("File not found: {path}")]
    #[diagnostic(code(graft::fs::not_found))]
    FileNotFound { path: String },

    #[error("Failed to read file: {path}: {reason}")]
    #[diagnostic(code(graft::fs::read_failed))]
    FileReadFailed { path: String, reason: String },

    #[error("Failed to write file: {path}: {reason}")]
    #[diagnostic(code(graft::fs::write_failed))]
    FileWriteFailed { path: String, reason: String },

    #[error("IO error: {message}")]
    #[diagnostic(code(graft::fs::io_error))]
    IoError { message: String },

    // Configuration errors
    #[error("Failed to parse {path}: {reason}")]
    #[diagnostic(code(graft::config::parse_failed))]
    ConfigParseFailed { path: String, reason: String },

    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(graft::config::invalid))]
    ConfigInvalid { message: String },

    // Signing errors
    #[error("Signing unavailable: {reason}")]
    #[diagnostic(
        code(graft::sign::unavailable),
        help("Configure 'signer.command' in graft.yaml, or allow unsigned executables")
    )]
    SigningUnavailable { reason: String },

    #[error("Signing failed: {reason}")]
    #[diagnostic(code(graft::sign::failed))]
    SigningFailed { reason: String },

    // Transaction errors
    #[error("Transaction for '{id}' aborted: {cause}")]
    #[diagnostic(code(graft::transaction::aborted))]
    TransactionAborted {
        id: String,
        #[source]
        cause: Box<GraftError>,
    },

    #[error("Operation cancelled")]
    #[diagnostic(code(graft::transaction::cancelled))]
    Cancelled,

    #[error("Rollback of '{id}' failed, bundle may be inconsistent: {reason}")]
    #[diagnostic(
        code(graft::transaction::rollback_failed),
        help("The transaction journal was kept at {}; restore the application manually", journal.display())
    )]
    RollbackFailed {
        id: String,
        journal: PathBuf,
        reason: String,
    },

    #[error("Failed to lock application '{id}': {reason}")]
    #[diagnostic(code(graft::transaction::lock_failed))]
    LockFailed { id: String, reason: String },
}

impl GraftError {
    /// Wrap an error raised inside a rolled-back transaction
    pub fn aborted(id: impl Into<String>, cause: GraftError) -> Self {
        GraftError::TransactionAborted {
            id: id.into(),
            cause: Box::new(cause),
        }
    }

    /// Whether the bundle may be left inconsistent after this error
    pub fn needs_repair(&self) -> bool {
        match self {
            GraftError::RollbackFailed { .. } => true,
            GraftError::TransactionAborted { cause, .. } => cause.needs_repair(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for GraftError {
    fn from(err: std::io::Error) -> Self {
        GraftError::IoError {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GraftError {
    fn from(err: serde_yaml::Error) -> Self {
        GraftError::ConfigParseFailed {
            path: "graft.yaml".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GraftError {
    fn from(err: serde_json::Error) -> Self {
        GraftError::ConfigParseFailed {
            path: "unknown".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<plist::Error> for GraftError {
    fn from(err: plist::Error) -> Self {
        GraftError::ConfigParseFailed {
            path: "Info.plist".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<goblin::error::Error> for GraftError {
    fn from(err: goblin::error::Error) -> Self {
        GraftError::MalformedBinary {
            reason: err.to_string(),
        }
    }
}

impl From<scroll::Error> for GraftError {
    fn from(err: scroll::Error) -> Self {
        GraftError::MalformedBinary {
            reason: err.to_string(),
        }
    }
}

impl From<inquire::InquireError> for GraftError {
    fn from(err: inquire::InquireError) -> Self {
        GraftError::IoError {
            message: err.to_string(),
        }
    }
}

/// Result type alias using miette for error handling
pub type Result<T> = miette::Result<T, GraftError>;
