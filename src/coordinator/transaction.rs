//! Patch transactions and their on-disk journal
//!
//! A transaction snapshots the executable and manifest into
//! `<state>/transactions/<app-id>/` before anything in the bundle changes,
//! records every path it creates or sets aside, and either commits (journal
//! removed) or rolls back (snapshot restored). If the process dies in between,
//! the journal directory is left behind and the next coordinator start rolls
//! it back (see [`pending`] and [`recover`]).
//!
//! ## Usage
//!
//! ```ignore
//! let mut tx = Transaction::begin(&transactions_dir, &app, &manifest_path)?;
//! tx.advance(Phase::Patching)?;
//! tx.track_created(&staged_path)?;
//! // ...
//! tx.commit()?;            // or drop: automatic rollback
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::app_file_stem;
use crate::directory::ApplicationRecord;
use crate::error::fs::{read_failed, write_failed};
use crate::error::{GraftError, Result};
use crate::store::copy_tree;

const JOURNAL_FILE: &str = "journal.json";
const EXECUTABLE_BACKUP: &str = "executable.bak";
const MANIFEST_BACKUP: &str = "manifest.bak";
const TRASH_DIR: &str = "trash";

/// Transaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Created,
    BackedUp,
    Patching,
    Staging,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl Phase {
    /// States in which the caller may still cancel
    pub fn is_cancellable(self) -> bool {
        matches!(self, Phase::Created | Phase::BackedUp | Phase::Patching)
    }
}

/// A path moved aside during the transaction and where its copy lives
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Preserved {
    original: PathBuf,
    saved: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Journal {
    application: String,
    phase: Phase,
    executable: PathBuf,
    manifest: PathBuf,
    manifest_existed: bool,
    #[serde(default)]
    created: Vec<PathBuf>,
    #[serde(default)]
    preserved: Vec<Preserved>,
}

/// An in-flight apply/remove for one application
#[derive(Debug)]
pub struct Transaction {
    dir: PathBuf,
    journal: Journal,
    finished: bool,
}

impl Transaction {
    /// Snapshot the executable and manifest and open the journal
    ///
    /// Everything written here is flushed before returning, so the caller may
    /// start modifying the bundle as soon as this succeeds.
    pub fn begin(
        transactions_dir: &Path,
        app: &ApplicationRecord,
        manifest_path: &Path,
    ) -> Result<Self> {
        let dir = transactions_dir.join(app_file_stem(&app.id));
        if dir.exists() {
            return Err(GraftError::LockFailed {
                id: app.id.clone(),
                reason: format!("an unrecovered transaction exists at {}", dir.display()),
            });
        }
        fs::create_dir_all(dir.join(TRASH_DIR)).map_err(|e| write_failed(&dir, e))?;

        // Until the journal is on disk nothing may be rolled back, so the
        // transaction starts out finished and failures just drop the directory.
        let mut tx = Transaction {
            journal: Journal {
                application: app.id.clone(),
                phase: Phase::BackedUp,
                executable: app.executable.clone(),
                manifest: manifest_path.to_path_buf(),
                manifest_existed: manifest_path.is_file(),
                created: Vec::new(),
                preserved: Vec::new(),
            },
            dir,
            finished: true,
        };

        let snapshot = durable_copy(&app.executable, &tx.dir.join(EXECUTABLE_BACKUP))
            .and_then(|()| {
                if tx.journal.manifest_existed {
                    durable_copy(manifest_path, &tx.dir.join(MANIFEST_BACKUP))
                } else {
                    Ok(())
                }
            })
            .and_then(|()| tx.persist());
        if let Err(e) = snapshot {
            let _ = fs::remove_dir_all(&tx.dir);
            return Err(e);
        }

        tx.finished = false;
        sync_dir(&tx.dir);
        log::debug!("{}: backed up to {}", app.id, tx.dir.display());
        Ok(tx)
    }

    pub fn phase(&self) -> Phase {
        self.journal.phase
    }

    pub fn application(&self) -> &str {
        &self.journal.application
    }

    pub fn advance(&mut self, phase: Phase) -> Result<()> {
        log::debug!(
            "{}: {:?} -> {:?}",
            self.journal.application,
            self.journal.phase,
            phase
        );
        self.journal.phase = phase;
        self.persist()
    }

    /// Record that `path` is about to be created inside the bundle
    pub fn track_created(&mut self, path: &Path) -> Result<()> {
        self.journal.created.push(path.to_path_buf());
        self.persist()
    }

    /// Save a copy of `path` so it can be put back on rollback
    ///
    /// Missing paths are ignored; there is nothing to restore.
    pub fn preserve(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let saved = self
            .dir
            .join(TRASH_DIR)
            .join(self.journal.preserved.len().to_string());
        copy_tree(path, &saved)?;
        self.journal.preserved.push(Preserved {
            original: path.to_path_buf(),
            saved,
        });
        self.persist()
    }

    /// Mark the transaction committed and discard the journal
    pub fn commit(mut self) -> Result<()> {
        self.journal.phase = Phase::Committed;
        self.persist()?;
        self.finished = true;
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            log::warn!(
                "committed, but could not remove journal {}: {e}",
                self.dir.display()
            );
        }
        Ok(())
    }

    /// Restore the snapshot and discard the journal
    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.journal.phase = Phase::RollingBack;
        let _ = self.persist();
        restore(&self.dir, &self.journal)
    }

    /// Leave the journal on disk without rolling back, as a crash would
    #[cfg(test)]
    pub fn abandon(mut self) {
        self.finished = true;
    }

    fn persist(&self) -> Result<()> {
        let path = self.dir.join(JOURNAL_FILE);
        let json = serde_json::to_vec_pretty(&self.journal)?;
        let mut temp = NamedTempFile::new_in(&self.dir).map_err(|e| write_failed(&path, e))?;
        temp.write_all(&json)
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|e| write_failed(&path, e))?;
        temp.persist(&path).map_err(|e| write_failed(&path, e.error))?;
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.journal.phase = Phase::RollingBack;
        let _ = self.persist();
        if let Err(e) = restore(&self.dir, &self.journal) {
            log::error!("automatic rollback failed: {e}");
        }
    }
}

/// Applications with a journal directory under `transactions_dir`
///
/// The identifier comes from the journal when it is readable, otherwise from
/// the directory name. Callers lock each one before calling [`recover`].
pub fn pending(transactions_dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(transactions_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(read_failed(transactions_dir, e)),
    };

    let mut ids: Vec<String> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .filter_map(|dir| {
            let journal = fs::read(dir.join(JOURNAL_FILE))
                .ok()
                .and_then(|bytes| serde_json::from_slice::<Journal>(&bytes).ok());
            match journal {
                Some(journal) => Some(journal.application),
                None => dir.file_name().map(|n| n.to_string_lossy().into_owned()),
            }
        })
        .collect();
    ids.sort();
    Ok(ids)
}

/// Roll back the abandoned transaction of one application, if any
pub fn recover(transactions_dir: &Path, app_id: &str) -> Result<bool> {
    let dir = transactions_dir.join(app_file_stem(app_id));
    if !dir.is_dir() {
        return Ok(false);
    }
    Ok(recover_dir(&dir)?.is_some())
}

fn recover_dir(dir: &Path) -> Result<Option<String>> {
    let journal_path = dir.join(JOURNAL_FILE);
    let journal: Journal = match fs::read(&journal_path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| GraftError::RollbackFailed {
            id: dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            journal: dir.to_path_buf(),
            reason: format!("unreadable journal: {e}"),
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // Interrupted before the snapshot finished; the bundle was never touched.
            log::debug!("discarding incomplete journal {}", dir.display());
            fs::remove_dir_all(dir).map_err(|e| write_failed(dir, e))?;
            return Ok(None);
        }
        Err(e) => return Err(read_failed(&journal_path, e)),
    };

    if journal.phase == Phase::Committed {
        log::debug!("discarding committed journal {}", dir.display());
        fs::remove_dir_all(dir).map_err(|e| write_failed(dir, e))?;
        return Ok(None);
    }

    log::warn!(
        "rolling back interrupted transaction for {} (was {:?})",
        journal.application,
        journal.phase
    );
    restore(dir, &journal)?;
    Ok(Some(journal.application))
}

/// Put the bundle back the way the snapshot in `dir` describes, then drop `dir`
fn restore(dir: &Path, journal: &Journal) -> Result<()> {
    let failed = |reason: String| GraftError::RollbackFailed {
        id: journal.application.clone(),
        journal: dir.to_path_buf(),
        reason,
    };

    // An application uninstalled since the crash leaves nothing to restore
    // inside its bundle; paths elsewhere are still put back.
    let bundle = journal.executable.parent().unwrap_or(Path::new(""));
    let bundle_gone = !bundle.is_dir();
    if bundle_gone {
        log::warn!(
            "{} is no longer installed; discarding its changes to {}",
            journal.application,
            bundle.display()
        );
    }
    let outside = |path: &Path| !(bundle_gone && path.starts_with(bundle));

    for path in journal.created.iter().rev().filter(|p| outside(p)) {
        remove_path(path).map_err(|e| failed(format!("removing {}: {e}", path.display())))?;
    }

    for item in journal.preserved.iter().rev().filter(|i| outside(&i.original)) {
        remove_path(&item.original)
            .and_then(|()| {
                if let Some(parent) = item.original.parent() {
                    fs::create_dir_all(parent)?;
                }
                Ok(())
            })
            .map_err(|e| failed(format!("restoring {}: {e}", item.original.display())))?;
        copy_tree(&item.saved, &item.original)
            .map_err(|e| failed(format!("restoring {}: {e}", item.original.display())))?;
    }

    if !bundle_gone {
        let backup = dir.join(EXECUTABLE_BACKUP);
        replace_with_copy(&backup, &journal.executable)
            .map_err(|e| failed(format!("restoring executable: {e}")))?;
        let original = fs::read(&backup).map_err(|e| failed(format!("reading backup: {e}")))?;
        let restored = fs::read(&journal.executable)
            .map_err(|e| failed(format!("re-reading executable: {e}")))?;
        if original != restored {
            return Err(failed("restored executable differs from backup".to_string()));
        }
    }

    if journal.manifest_existed {
        replace_with_copy(&dir.join(MANIFEST_BACKUP), &journal.manifest)
            .map_err(|e| failed(format!("restoring manifest: {e}")))?;
    } else {
        remove_path(&journal.manifest)
            .map_err(|e| failed(format!("removing manifest: {e}")))?;
    }

    fs::remove_dir_all(dir).map_err(|e| failed(format!("removing journal: {e}")))?;
    log::info!("rolled back {}", journal.application);
    Ok(())
}

/// Atomically replace `target` with the contents and permissions of `source`
fn replace_with_copy(source: &Path, target: &Path) -> std::io::Result<()> {
    let bytes = fs::read(source)?;
    let permissions = fs::metadata(source)?.permissions();
    write_atomic(target, &bytes, permissions)
}

/// Write `bytes` to `target` via a synced temp file in the same directory
pub(crate) fn write_atomic(
    target: &Path,
    bytes: &[u8],
    permissions: fs::Permissions,
) -> std::io::Result<()> {
    let dir = target
        .parent()
        .ok_or_else(|| std::io::Error::other("target has no parent directory"))?;
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().set_permissions(permissions)?;
    temp.as_file().sync_all()?;
    temp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

fn durable_copy(source: &Path, target: &Path) -> Result<()> {
    fs::copy(source, target).map_err(|e| read_failed(source, e))?;
    File::open(target)
        .and_then(|f| f.sync_all())
        .map_err(|e| write_failed(target, e))
}

fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        log::debug!("could not sync {}: {e}", dir.display());
    }
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
