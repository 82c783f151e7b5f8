//! Per-application mutual exclusion
//!
//! Two layers: an in-process registry keyed by application identifier, so
//! threads sharing one coordinator queue up, and an advisory file lock so
//! separate `graft` processes do too. Different applications never contend.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, PoisonError};

use fslock::LockFile;

use crate::config::app_file_stem;
use crate::error::{GraftError, Result};

/// Identifiers currently held by a transaction in this process
#[derive(Debug, Default)]
pub struct LockRegistry {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `id` is free in this process and on disk, then hold it
    pub fn acquire(&self, id: &str, locks_dir: &Path) -> Result<AppLock<'_>> {
        {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            while held.contains(id) {
                log::debug!("waiting for in-flight transaction on {id}");
                held = self
                    .released
                    .wait(held)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            held.insert(id.to_string());
        }

        // From here on the guard releases the registry slot on any early return.
        let mut guard = AppLock {
            registry: self,
            id: id.to_string(),
            file: None,
        };

        fs::create_dir_all(locks_dir).map_err(|e| GraftError::LockFailed {
            id: id.to_string(),
            reason: format!("cannot create {}: {e}", locks_dir.display()),
        })?;
        let path: PathBuf = locks_dir.join(format!("{}.lock", app_file_stem(id)));
        let mut file = LockFile::open(&path).map_err(|e| GraftError::LockFailed {
            id: id.to_string(),
            reason: format!("cannot open {}: {e}", path.display()),
        })?;
        file.lock().map_err(|e| GraftError::LockFailed {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        guard.file = Some(file);
        Ok(guard)
    }

    pub fn is_held(&self, id: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }
}

/// RAII guard for one application's lock
#[derive(Debug)]
pub struct AppLock<'a> {
    registry: &'a LockRegistry,
    id: String,
    file: Option<LockFile>,
}

impl Drop for AppLock<'_> {
    fn drop(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.unlock();
        }
        let mut held = self
            .registry
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.id);
        self.registry.released.notify_all();
    }
}
