//! Attachment manifest persistence
//!
//! One JSON document per application. Writes go through a temp file in the
//! same directory followed by a rename, so readers see either the old or the
//! new manifest. A missing manifest means nothing is attached.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::module::{InjectableModule, ModuleKind};
use crate::error::{GraftError, Result, fs::read_failed, fs::write_failed};

/// A module currently attached to an application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub relative_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub content_hash: String,
    pub kind: ModuleKind,
    pub source: PathBuf,
    /// Disabled modules keep their entry but are neither linked nor staged
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl From<&InjectableModule> for Attachment {
    fn from(module: &InjectableModule) -> Self {
        Self {
            name: module.name.clone(),
            relative_path: module.relative_path.clone(),
            reference: module.reference.clone(),
            content_hash: module.content_hash.clone(),
            kind: module.kind,
            source: module.source.clone(),
            enabled: true,
        }
    }
}

/// Attachments of one application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub application: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl Manifest {
    pub fn new(application: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            attachments: Vec::new(),
        }
    }

    /// Load the manifest at `path`, or an empty one if it does not exist
    pub fn load(path: &Path, application: &str) -> Result<Self> {
        let json = match std::fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::new(application));
            }
            Err(e) => return Err(read_failed(path, e)),
        };
        let manifest: Self =
            serde_json::from_str(&json).map_err(|e| GraftError::ConfigParseFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        if manifest.application != application {
            return Err(GraftError::IntegrityMismatch {
                id: application.to_string(),
                detail: format!(
                    "manifest {} belongs to '{}'",
                    path.display(),
                    manifest.application
                ),
            });
        }
        Ok(manifest)
    }

    /// Atomically replace the manifest at `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| write_failed(path, "manifest path has no parent directory"))?;
        std::fs::create_dir_all(dir).map_err(|e| write_failed(dir, e))?;

        let json = serde_json::to_string_pretty(self)?;
        let mut temp = NamedTempFile::new_in(dir).map_err(|e| write_failed(path, e))?;
        temp.write_all(json.as_bytes())
            .and_then(|()| temp.write_all(b"\n"))
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|e| write_failed(path, e))?;
        temp.persist(path).map_err(|e| write_failed(path, e.error))?;
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&Attachment> {
        self.attachments.iter().find(|a| a.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn insert(&mut self, attachment: Attachment) {
        self.attachments.retain(|a| a.name != attachment.name);
        self.attachments.push(attachment);
    }

    pub fn remove(&mut self, name: &str) -> Option<Attachment> {
        let index = self.attachments.iter().position(|a| a.name == name)?;
        Some(self.attachments.remove(index))
    }

    /// Load command paths the executable is expected to carry
    pub fn references(&self) -> BTreeSet<String> {
        self.attachments
            .iter()
            .filter(|a| a.enabled)
            .filter_map(|a| a.reference.clone())
            .collect()
    }
}
