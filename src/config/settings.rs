//! Settings file (graft.yaml) data structures

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GraftError, Result, fs::read_failed};

/// Settings file name inside the state directory
pub const SETTINGS_FILE: &str = "graft.yaml";

/// Top-level settings (graft.yaml)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Which applications may be patched
    pub eligibility: EligibilityPolicy,

    /// What happens to running instances after a commit
    pub reload: ReloadSettings,

    /// External code signer
    pub signer: SignerSettings,

    /// Insert weak load commands by default
    pub weak_references: bool,
}

/// Eligibility policy for system and restricted applications
///
/// The system reports removable and removed system applications separately;
/// whether either may be patched is a local decision, so both are switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EligibilityPolicy {
    pub allow_removable_system_apps: bool,
    pub allow_removed_system_apps: bool,
    pub allow_restricted: bool,

    /// Refuse to commit an executable that could not be re-signed
    pub require_signature: bool,
}

impl Default for EligibilityPolicy {
    fn default() -> Self {
        Self {
            allow_removable_system_apps: true,
            allow_removed_system_apps: false,
            allow_restricted: false,
            require_signature: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloadSettings {
    pub enabled: bool,

    /// Ask processes to exit (SIGTERM) before forcing them
    pub soft: bool,

    /// Daemon restarted alongside the application, e.g. `SpringBoard`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub companion_daemon: Option<String>,
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            soft: true,
            companion_daemon: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerSettings {
    /// Signing tool such as `ldid`; unset means no signer is available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<PathBuf>,

    /// Arguments placed before the executable path
    pub args: Vec<String>,
}

impl Default for SignerSettings {
    fn default() -> Self {
        Self {
            command: None,
            args: vec!["-S".to_string()],
        }
    }
}

impl Settings {
    /// Parse settings from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let settings: Self = serde_yaml::from_str(yaml)?;
        Ok(settings)
    }

    /// Serialize settings to a YAML string
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Load settings from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(yaml) => Self::from_yaml(&yaml).map_err(|e| match e {
                GraftError::ConfigParseFailed { reason, .. } => GraftError::ConfigParseFailed {
                    path: path.display().to_string(),
                    reason,
                },
                other => other,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(read_failed(path, e)),
        }
    }
}
