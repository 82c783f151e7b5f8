//! Per-application module copies kept outside the bundle
//!
//! Two of these live in the state directory. `persistent/` keeps a copy of
//! every injected source so the modules can be injected again after an app
//! update wipes the bundle. `disabled/` holds staged copies taken out of the
//! bundle by a disable, until they are enabled or ejected.

use std::fs;
use std::path::{Path, PathBuf};

use super::copy_tree;
use super::module::has_module_extension;
use crate::config::app_file_stem;
use crate::error::fs::{read_failed, write_failed};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct AssetStore {
    root: PathBuf,
}

impl AssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dir(&self, app_id: &str) -> PathBuf {
        self.root.join(app_file_stem(app_id))
    }

    pub fn path(&self, app_id: &str, name: &str) -> PathBuf {
        self.dir(app_id).join(name)
    }

    pub fn contains(&self, app_id: &str, name: &str) -> bool {
        fs::symlink_metadata(self.path(app_id, name)).is_ok()
    }

    /// Kept modules of `app_id`, sorted by name
    ///
    /// Hidden entries and files that are not modules are skipped.
    pub fn list(&self, app_id: &str) -> Result<Vec<PathBuf>> {
        let dir = self.dir(app_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(read_failed(&dir, e)),
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| !n.starts_with('.'))
            })
            .filter(|p| has_module_extension(p))
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Copy `source` in under `name`, replacing any earlier copy
    pub fn keep(&self, app_id: &str, name: &str, source: &Path) -> Result<PathBuf> {
        let dir = self.dir(app_id);
        fs::create_dir_all(&dir).map_err(|e| write_failed(&dir, e))?;
        let target = dir.join(name);
        remove_entry(&target)?;
        copy_tree(source, &target)?;
        log::debug!("kept {} at {}", name, target.display());
        Ok(target)
    }

    /// Drop the copy of `name`; a missing copy is not an error
    pub fn discard(&self, app_id: &str, name: &str) -> Result<()> {
        remove_entry(&self.path(app_id, name))?;
        let dir = self.dir(app_id);
        if fs::read_dir(&dir).is_ok_and(|mut entries| entries.next().is_none()) {
            let _ = fs::remove_dir(&dir);
        }
        Ok(())
    }
}

fn remove_entry(path: &Path) -> Result<()> {
    let removed = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };
    removed.map_err(|e| write_failed(path, e))
}
