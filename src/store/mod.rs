//! Module Store
//!
//! Owns the staged copies of injected modules inside each application bundle
//! and the per-application manifest recording them. The manifest is written
//! last when attaching and first when detaching, so a crash can only leave
//! unrecorded files behind, never a record pointing at nothing.

pub mod assets;
pub mod manifest;
pub mod module;

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

pub use assets::AssetStore;
pub use manifest::{Attachment, Manifest};
pub use module::{InjectableModule, MODULES_DIR, ModuleKind, is_module_reference};

use crate::config::app_file_stem;
use crate::directory::ApplicationRecord;
use crate::error::fs::{io_error, write_failed};
use crate::error::{GraftError, Result};
use crate::hash;

/// Empty file dropped into staged bundles to mark them as ours
pub const MARKER_FILE_NAME: &str = ".graft";

/// Problem found when checking a staged module against its record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedDrift {
    Missing,
    HashMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone)]
pub struct ModuleStore {
    manifests_dir: PathBuf,
}

impl ModuleStore {
    pub fn new(manifests_dir: impl Into<PathBuf>) -> Self {
        Self {
            manifests_dir: manifests_dir.into(),
        }
    }

    pub fn manifest_path(&self, app_id: &str) -> PathBuf {
        self.manifests_dir
            .join(format!("{}.json", app_file_stem(app_id)))
    }

    pub fn load_manifest(&self, app_id: &str) -> Result<Manifest> {
        Manifest::load(&self.manifest_path(app_id), app_id)
    }

    pub fn list_attachments(&self, app_id: &str) -> Result<Vec<Attachment>> {
        Ok(self.load_manifest(app_id)?.attachments)
    }

    /// Where `module` lands inside the application bundle
    pub fn destination(app: &ApplicationRecord, module: &InjectableModule) -> PathBuf {
        app.bundle_root.join(&module.relative_path)
    }

    /// Copy `module` into the bundle and record the attachment
    pub fn stage(&self, app: &ApplicationRecord, module: &InjectableModule) -> Result<Attachment> {
        let mut manifest = self.load_manifest(&app.id)?;
        if manifest.contains(&module.name) {
            return Err(GraftError::AlreadyAttached {
                id: app.id.clone(),
                module: module.name.clone(),
            });
        }

        let destination = Self::destination(app, module);
        if destination.exists() {
            return Err(write_failed(&destination, "destination already exists"));
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| write_failed(parent, e))?;
        }

        copy_tree(&module.source, &destination)?;
        if destination.is_dir() {
            fs::write(destination.join(MARKER_FILE_NAME), b"")
                .map_err(|e| write_failed(&destination, e))?;
        }

        let staged_hash = hash::hash_module(&destination)?;
        if !hash::verify_hash(&module.content_hash, &staged_hash) {
            return Err(GraftError::HashMismatch {
                name: module.name.clone(),
            });
        }

        let attachment = Attachment::from(module);
        manifest.insert(attachment.clone());
        manifest.save(&self.manifest_path(&app.id))?;
        log::debug!("staged {} at {}", module.name, destination.display());
        Ok(attachment)
    }

    /// Drop the manifest entry for `name`, leaving files in place
    pub fn detach(&self, app_id: &str, name: &str) -> Result<Attachment> {
        let mut manifest = self.load_manifest(app_id)?;
        let attachment = manifest.remove(name).ok_or_else(|| GraftError::NotAttached {
            id: app_id.to_string(),
            module: name.to_string(),
        })?;
        manifest.save(&self.manifest_path(app_id))?;
        Ok(attachment)
    }

    /// Remove the manifest entry, then the staged files
    ///
    /// Files that were already removed by someone else are only warned about.
    pub fn unstage(&self, app: &ApplicationRecord, name: &str) -> Result<Attachment> {
        let attachment = self.detach(&app.id, name)?;
        if attachment.enabled {
            remove_staged(app, &attachment)?;
        }
        log::debug!("unstaged {} from {}", attachment.name, app.id);
        Ok(attachment)
    }

    /// Mark `name` disabled, then take its staged files out of the bundle
    pub fn withdraw(&self, app: &ApplicationRecord, name: &str) -> Result<Attachment> {
        let attachment = self.set_enabled(&app.id, name, false)?;
        remove_staged(app, &attachment)?;
        log::debug!("withdrew {} from {}", attachment.name, app.id);
        Ok(attachment)
    }

    /// Stage a disabled module again from `copy`, then mark it enabled
    ///
    /// The copy must still hash to the recorded content.
    pub fn restage(&self, app: &ApplicationRecord, name: &str, copy: &Path) -> Result<Attachment> {
        let attachment = self
            .load_manifest(&app.id)?
            .find(name)
            .cloned()
            .ok_or_else(|| GraftError::NotAttached {
                id: app.id.clone(),
                module: name.to_string(),
            })?;
        let destination = app.bundle_root.join(&attachment.relative_path);
        if fs::symlink_metadata(&destination).is_ok() {
            return Err(write_failed(&destination, "destination already exists"));
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| write_failed(parent, e))?;
        }
        copy_tree(copy, &destination)?;
        if destination.is_dir() {
            fs::write(destination.join(MARKER_FILE_NAME), b"")
                .map_err(|e| write_failed(&destination, e))?;
        }
        if !hash::verify_hash(&attachment.content_hash, &hash::hash_module(&destination)?) {
            return Err(GraftError::HashMismatch {
                name: attachment.name,
            });
        }
        self.set_enabled(&app.id, name, true)
    }

    fn set_enabled(&self, app_id: &str, name: &str, enabled: bool) -> Result<Attachment> {
        let mut manifest = self.load_manifest(app_id)?;
        let attachment = manifest
            .attachments
            .iter_mut()
            .find(|a| a.name == name)
            .ok_or_else(|| GraftError::NotAttached {
                id: app_id.to_string(),
                module: name.to_string(),
            })?;
        attachment.enabled = enabled;
        let attachment = attachment.clone();
        manifest.save(&self.manifest_path(app_id))?;
        Ok(attachment)
    }

    /// Compare a staged module on disk against its recorded hash
    pub fn check(app: &ApplicationRecord, attachment: &Attachment) -> Result<Option<StagedDrift>> {
        let staged = app.bundle_root.join(&attachment.relative_path);
        if !staged.exists() {
            return Ok(Some(StagedDrift::Missing));
        }
        let actual = hash::hash_module(&staged)?;
        if hash::verify_hash(&attachment.content_hash, &actual) {
            Ok(None)
        } else {
            Ok(Some(StagedDrift::HashMismatch {
                expected: attachment.content_hash.clone(),
                actual,
            }))
        }
    }
}

fn remove_staged(app: &ApplicationRecord, attachment: &Attachment) -> Result<()> {
    let staged = app.bundle_root.join(&attachment.relative_path);
    match fs::symlink_metadata(&staged) {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(&staged).map_err(|e| write_failed(&staged, e))?;
        }
        Ok(_) => fs::remove_file(&staged).map_err(|e| write_failed(&staged, e))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::warn!(
                "staged module {} was already missing at {}",
                attachment.name,
                staged.display()
            );
        }
        Err(e) => return Err(write_failed(&staged, e)),
    }
    Ok(())
}

/// Copy a file or a directory tree to `destination`, preserving permissions
pub(crate) fn copy_tree(source: &Path, destination: &Path) -> Result<()> {
    if !source.is_dir() {
        fs::copy(source, destination).map_err(|e| write_failed(destination, e))?;
        return Ok(());
    }

    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| io_error(format!("walking {}: {e}", source.display())))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io_error(e.to_string()))?;
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| write_failed(&target, e))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| write_failed(&target, e))?;
        }
    }
    Ok(())
}
