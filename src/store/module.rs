//! Injectable module resolution
//!
//! A module is identified by its file name. Its kind comes from the extension
//! and determines where it is staged and what load command (if any) refers to it.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GraftError, Result};
use crate::{hash, patcher};

/// Directory inside the bundle that holds staged libraries and frameworks
pub const MODULES_DIR: &str = "GraftModules";

/// Load command prefix of every reference we own
pub const REFERENCE_PREFIX: &str = "@executable_path/GraftModules/";

/// Runtime support libraries that are never injected as tweaks
const RUNTIME_NAMES: &[&str] = &[
    "cydiasubstrate",
    "cydiasubstrate.framework",
    "ellekit",
    "ellekit.framework",
    "libsubstrate.dylib",
    "libsubstitute.dylib",
    "libellekit.dylib",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    DynamicLibrary,
    Framework,
    ResourceBundle,
}

impl ModuleKind {
    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "dylib" => Some(Self::DynamicLibrary),
            "framework" => Some(Self::Framework),
            "bundle" => Some(Self::ResourceBundle),
            _ => None,
        }
    }

    /// Whether the executable carries a load command for this kind
    pub fn is_linked(self) -> bool {
        !matches!(self, Self::ResourceBundle)
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DynamicLibrary => "dylib",
            Self::Framework => "framework",
            Self::ResourceBundle => "bundle",
        })
    }
}

/// Whether `path` has the extension of a module kind graft can inject
pub fn has_module_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ModuleKind::from_extension(&ext.to_ascii_lowercase()).is_some())
}

/// A module resolved from a source path, ready to be staged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectableModule {
    pub name: String,
    pub source: PathBuf,
    pub kind: ModuleKind,
    /// Destination relative to the bundle root
    pub relative_path: PathBuf,
    /// Install name written into the executable, `None` for resource bundles
    pub reference: Option<String>,
    pub content_hash: String,
}

impl InjectableModule {
    /// Resolve and validate a module from its source path
    pub fn resolve(source: &Path) -> Result<Self> {
        let invalid = |reason: &str| GraftError::InvalidModule {
            path: source.display().to_string(),
            reason: reason.to_string(),
        };

        if !source.exists() {
            return Err(GraftError::ModuleNotFound {
                path: source.display().to_string(),
            });
        }
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| invalid("file name is not valid UTF-8"))?
            .to_string();
        if RUNTIME_NAMES.contains(&name.to_lowercase().as_str()) {
            return Err(invalid("hooking runtimes are provided by the system, not injected"));
        }
        let kind = source
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| ModuleKind::from_extension(&ext.to_ascii_lowercase()))
            .ok_or_else(|| invalid("unsupported module type"))?;

        let (relative_path, reference) = match kind {
            ModuleKind::DynamicLibrary => {
                if !source.is_file() {
                    return Err(invalid("a .dylib must be a regular file"));
                }
                require_mach_o(source, source)?;
                (
                    Path::new(MODULES_DIR).join(&name),
                    Some(format!("{REFERENCE_PREFIX}{name}")),
                )
            }
            ModuleKind::Framework => {
                if !source.is_dir() {
                    return Err(invalid("a .framework must be a directory"));
                }
                let executable = framework_executable(source);
                require_mach_o(source, &source.join(&executable))?;
                (
                    Path::new(MODULES_DIR).join(&name),
                    Some(format!("{REFERENCE_PREFIX}{name}/{executable}")),
                )
            }
            ModuleKind::ResourceBundle => {
                if !source.is_dir() {
                    return Err(invalid("a .bundle must be a directory"));
                }
                (PathBuf::from(&name), None)
            }
        };

        Ok(Self {
            content_hash: hash::hash_module(source)?,
            name,
            source: source.to_path_buf(),
            kind,
            relative_path,
            reference,
        })
    }
}

/// Whether a load command path is one of ours
pub fn is_module_reference(path: &str) -> bool {
    path.starts_with(REFERENCE_PREFIX)
}

/// `CFBundleExecutable` of a framework, falling back to the bundle stem
fn framework_executable(framework: &Path) -> String {
    #[derive(Deserialize)]
    struct FrameworkInfo {
        #[serde(rename = "CFBundleExecutable")]
        executable: String,
    }

    plist::from_file::<_, FrameworkInfo>(framework.join("Info.plist"))
        .map(|info| info.executable)
        .unwrap_or_else(|_| {
            framework
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
}

fn require_mach_o(module: &Path, binary: &Path) -> Result<()> {
    let data = std::fs::read(binary).map_err(|e| GraftError::InvalidModule {
        path: module.display().to_string(),
        reason: format!("cannot read {}: {e}", binary.display()),
    })?;
    if patcher::is_mach_o(&data) {
        Ok(())
    } else {
        Err(GraftError::InvalidModule {
            path: module.display().to_string(),
            reason: format!("{} is not a Mach-O image", binary.display()),
        })
    }
}
