//! Application Directory
//!
//! The source of truth for which applications are installed and where they
//! live. Records are rebuilt from disk on every query and never cached, since
//! applications can be installed, updated or removed underneath us at any time.
//!
//! - [`ApplicationDirectory`]: the read-only capability the engine consumes
//! - [`FsDirectory`]: implementation over on-device container directories

mod entitlements;
mod filesystem;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::error::Result;

pub use filesystem::FsDirectory;

/// Whether an application was installed by the user or ships with the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationType {
    User,
    System,
}

/// Basic metadata returned by enumeration
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationSummary {
    pub id: String,
    pub name: String,
    pub version: Option<String>,
    pub kind: ApplicationType,
    pub bundle_root: PathBuf,
}

/// Container locations of an application
#[derive(Debug, Clone, Default, Serialize)]
pub struct Containers {
    pub bundle: PathBuf,
    pub data: Option<PathBuf>,
    pub groups: BTreeMap<String, PathBuf>,
}

/// An app extension embedded under `PlugIns/`
#[derive(Debug, Clone, Serialize)]
pub struct PlugIn {
    pub id: String,
    pub path: PathBuf,
}

/// Policy-relevant flags reported by the system for an application
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplicationFlags {
    pub restricted: bool,
    pub removable_system_app: bool,
    pub removed_system_app: bool,
}

/// Everything known about one installed application at the time of lookup
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationRecord {
    pub id: String,
    pub name: String,
    pub version: Option<String>,
    pub kind: ApplicationType,
    pub bundle_root: PathBuf,
    pub executable: PathBuf,
    pub containers: Containers,
    pub entitlements: BTreeMap<String, plist::Value>,
    pub plugins: Vec<PlugIn>,
    pub flags: ApplicationFlags,
}

impl ApplicationRecord {
    pub fn summary(&self) -> ApplicationSummary {
        ApplicationSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            kind: self.kind,
            bundle_root: self.bundle_root.clone(),
        }
    }
}

/// Read-only view of installed applications
pub trait ApplicationDirectory: Send + Sync {
    /// Enumerate installed applications, skipping entries that cannot be read
    fn list_applications(&self) -> Result<Vec<ApplicationSummary>>;

    /// Resolve one application by bundle identifier
    ///
    /// Fails with `ApplicationNotFound` if no installed application has `id`.
    fn lookup(&self, id: &str) -> Result<ApplicationRecord>;
}
