//! Code signing collaborators
//!
//! Editing load commands invalidates an executable's signature. A [`Signer`]
//! turns the patched buffer into one the platform will run. When no signer is
//! configured the coordinator commits the unsigned buffer and warns, unless
//! policy requires a signature.

use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

use tempfile::NamedTempFile;

use crate::config::SignerSettings;
use crate::error::{GraftError, Result};

pub trait Signer: Send + Sync {
    /// Return a signed copy of `executable`
    ///
    /// Fails with `SigningUnavailable` when no signing capability exists,
    /// which callers may treat as non-fatal.
    fn sign(&self, executable: &[u8]) -> Result<Vec<u8>>;
}

/// Signer used when nothing is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableSigner;

impl Signer for UnavailableSigner {
    fn sign(&self, _executable: &[u8]) -> Result<Vec<u8>> {
        Err(GraftError::SigningUnavailable {
            reason: "no signer configured".to_string(),
        })
    }
}

/// Signs by running an external tool (such as `ldid -S`) on a temp copy
#[derive(Debug, Clone)]
pub struct CommandSigner {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandSigner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Signer for CommandSigner {
    fn sign(&self, executable: &[u8]) -> Result<Vec<u8>> {
        let mut temp = NamedTempFile::new()?;
        temp.write_all(executable)?;
        temp.flush()?;

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(temp.path())
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    GraftError::SigningUnavailable {
                        reason: format!("cannot run {}: {e}", self.program.display()),
                    }
                }
                _ => GraftError::SigningFailed {
                    reason: e.to_string(),
                },
            })?;

        if !output.status.success() {
            return Err(GraftError::SigningFailed {
                reason: format!(
                    "{} exited with {}: {}",
                    self.program.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(std::fs::read(temp.path())?)
    }
}

/// Build the signer described by settings
pub fn from_settings(settings: &SignerSettings) -> Box<dyn Signer> {
    match &settings.command {
        Some(program) => Box::new(CommandSigner::new(program, settings.args.clone())),
        None => Box::new(UnavailableSigner),
    }
}
