//! Application Directory backed by the on-device container layout
//!
//! ```text
//! <apps_root>/
//! └── <container-uuid>/
//!     ├── Demo.app/                # Info.plist, executable, PlugIns/
//!     └── Demo.metadata.plist      # optional flags and container paths
//! <system_apps_root>/
//! ├── Maps.app/
//! └── Maps.metadata.plist
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::entitlements::read_entitlements;
use super::{
    ApplicationDirectory, ApplicationFlags, ApplicationRecord, ApplicationSummary,
    ApplicationType, Containers, PlugIn,
};
use crate::error::{GraftError, Result};

const PLUGINS_DIR: &str = "PlugIns";
const METADATA_SUFFIX: &str = ".metadata.plist";

#[derive(Debug, Deserialize)]
struct BundleInfo {
    #[serde(rename = "CFBundleIdentifier")]
    id: String,
    #[serde(rename = "CFBundleExecutable")]
    executable: String,
    #[serde(rename = "CFBundleDisplayName")]
    display_name: Option<String>,
    #[serde(rename = "CFBundleName")]
    bundle_name: Option<String>,
    #[serde(rename = "CFBundleShortVersionString")]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlugInInfo {
    #[serde(rename = "CFBundleIdentifier")]
    id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct ContainerMetadata {
    restricted: bool,
    removable_system_app: bool,
    removed_system_app: bool,
    data_container: Option<PathBuf>,
    group_containers: BTreeMap<String, PathBuf>,
}

/// Filesystem-backed application directory
#[derive(Debug, Clone)]
pub struct FsDirectory {
    apps_root: PathBuf,
    system_apps_root: Option<PathBuf>,
}

impl FsDirectory {
    pub fn new(apps_root: impl Into<PathBuf>, system_apps_root: Option<PathBuf>) -> Self {
        Self {
            apps_root: apps_root.into(),
            system_apps_root,
        }
    }

    /// Candidate `.app` directories, in a stable order
    fn bundles(&self) -> Vec<(ApplicationType, PathBuf)> {
        let mut found = Vec::new();
        for container in sorted_children(&self.apps_root) {
            if !container.is_dir() {
                continue;
            }
            for bundle in sorted_children(&container) {
                if is_app_bundle(&bundle) {
                    found.push((ApplicationType::User, bundle));
                }
            }
        }
        if let Some(system_root) = &self.system_apps_root {
            for bundle in sorted_children(system_root) {
                if is_app_bundle(&bundle) {
                    found.push((ApplicationType::System, bundle));
                }
            }
        }
        found
    }

    fn build_record(
        &self,
        kind: ApplicationType,
        bundle_root: PathBuf,
        info: BundleInfo,
    ) -> Result<ApplicationRecord> {
        let metadata = read_metadata(&bundle_root)?;
        let executable = bundle_root.join(&info.executable);

        let entitlements = match fs::read(&executable) {
            Ok(data) => read_entitlements(&data).unwrap_or_else(|e| {
                log::debug!("no entitlements for {}: {e}", executable.display());
                BTreeMap::new()
            }),
            Err(e) => {
                log::debug!("cannot read {}: {e}", executable.display());
                BTreeMap::new()
            }
        };

        let container = match kind {
            ApplicationType::User => bundle_root
                .parent()
                .map_or_else(|| bundle_root.clone(), Path::to_path_buf),
            ApplicationType::System => bundle_root.clone(),
        };

        Ok(ApplicationRecord {
            name: display_name(&info, &bundle_root),
            id: info.id,
            version: info.version,
            kind,
            plugins: read_plugins(&bundle_root),
            executable,
            containers: Containers {
                bundle: container,
                data: metadata.data_container,
                groups: metadata.group_containers,
            },
            entitlements,
            flags: ApplicationFlags {
                restricted: metadata.restricted,
                removable_system_app: metadata.removable_system_app,
                removed_system_app: metadata.removed_system_app,
            },
            bundle_root,
        })
    }
}

impl ApplicationDirectory for FsDirectory {
    fn list_applications(&self) -> Result<Vec<ApplicationSummary>> {
        let mut apps: Vec<ApplicationSummary> = Vec::new();
        for (kind, bundle_root) in self.bundles() {
            let info = match read_bundle_info(&bundle_root) {
                Ok(info) => info,
                Err(e) => {
                    log::debug!("skipping {}: {e}", bundle_root.display());
                    continue;
                }
            };
            if apps.iter().any(|app| app.id == info.id) {
                log::warn!(
                    "duplicate bundle identifier {} at {}",
                    info.id,
                    bundle_root.display()
                );
                continue;
            }
            apps.push(ApplicationSummary {
                name: display_name(&info, &bundle_root),
                id: info.id,
                version: info.version,
                kind,
                bundle_root,
            });
        }
        apps.sort_by(|a, b| {
            a.kind
                .cmp(&b.kind)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        Ok(apps)
    }

    fn lookup(&self, id: &str) -> Result<ApplicationRecord> {
        for (kind, bundle_root) in self.bundles() {
            let Ok(info) = read_bundle_info(&bundle_root) else {
                continue;
            };
            if info.id == id {
                return self.build_record(kind, bundle_root, info);
            }
        }
        Err(GraftError::ApplicationNotFound { id: id.to_string() })
    }
}

fn sorted_children(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        log::debug!("cannot list {}", dir.display());
        return Vec::new();
    };
    let mut children: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    children.sort();
    children
}

fn is_app_bundle(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "app") && path.is_dir()
}

fn read_bundle_info(bundle_root: &Path) -> Result<BundleInfo> {
    let path = bundle_root.join("Info.plist");
    plist::from_file(&path).map_err(|e| GraftError::InvalidBundle {
        path: bundle_root.display().to_string(),
        reason: format!("unreadable Info.plist: {e}"),
    })
}

fn display_name(info: &BundleInfo, bundle_root: &Path) -> String {
    info.display_name
        .clone()
        .or_else(|| info.bundle_name.clone())
        .unwrap_or_else(|| {
            bundle_root
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| info.id.clone())
        })
}

/// Path of the metadata plist that sits next to `bundle_root`
pub(crate) fn metadata_path(bundle_root: &Path) -> Option<PathBuf> {
    let stem = bundle_root.file_stem()?.to_string_lossy();
    Some(
        bundle_root
            .parent()?
            .join(format!("{stem}{METADATA_SUFFIX}")),
    )
}

fn read_metadata(bundle_root: &Path) -> Result<ContainerMetadata> {
    let Some(path) = metadata_path(bundle_root).filter(|p| p.is_file()) else {
        return Ok(ContainerMetadata::default());
    };
    plist::from_file(&path).map_err(|e| GraftError::InvalidBundle {
        path: path.display().to_string(),
        reason: format!("malformed metadata: {e}"),
    })
}

fn read_plugins(bundle_root: &Path) -> Vec<PlugIn> {
    let mut plugins = Vec::new();
    for path in sorted_children(&bundle_root.join(PLUGINS_DIR)) {
        if path.extension().is_none_or(|ext| ext != "appex") {
            continue;
        }
        match plist::from_file::<_, PlugInInfo>(path.join("Info.plist")) {
            Ok(info) => plugins.push(PlugIn { id: info.id, path }),
            Err(e) => log::debug!("skipping plug-in {}: {e}", path.display()),
        }
    }
    plugins
}
