//! Configuration for Graft
//!
//! - `graft.yaml` settings ([`Settings`])
//! - The state directory layout ([`StateDir`]) holding manifests, transaction
//!   journals and lock files
//!
//! ## State Directory Structure
//!
//! ```text
//! <state_dir>/
//! ├── graft.yaml                 # optional settings
//! ├── manifests/<app-id>.json    # attached modules per application
//! ├── transactions/<app-id>/     # journal of an in-flight transaction
//! ├── persistent/<app-id>/       # kept copies of injected modules
//! ├── disabled/<app-id>/         # staged copies of disabled modules
//! └── locks/<app-id>.lock        # advisory per-application lock
//! ```

pub mod settings;

use std::path::{Path, PathBuf};

pub use settings::{EligibilityPolicy, Settings, SignerSettings};

use crate::error::{GraftError, Result};

/// Default root of user application containers on device
pub const DEFAULT_APPS_ROOT: &str = "/var/containers/Bundle/Application";

/// Default root of system applications on device
pub const DEFAULT_SYSTEM_APPS_ROOT: &str = "/Applications";

const MANIFESTS_DIR: &str = "manifests";
const TRANSACTIONS_DIR: &str = "transactions";
const LOCKS_DIR: &str = "locks";
const PERSISTENT_DIR: &str = "persistent";
const DISABLED_DIR: &str = "disabled";

/// Layout of the persistent state directory
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<data-local-dir>/graft`
    pub fn default_location() -> Result<Self> {
        dirs::data_local_dir()
            .map(|dir| Self::new(dir.join("graft")))
            .ok_or_else(|| GraftError::ConfigInvalid {
                message: "cannot determine a state directory; pass --state-dir".to_string(),
            })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join(settings::SETTINGS_FILE)
    }

    pub fn manifests(&self) -> PathBuf {
        self.root.join(MANIFESTS_DIR)
    }

    pub fn transactions(&self) -> PathBuf {
        self.root.join(TRANSACTIONS_DIR)
    }

    pub fn locks(&self) -> PathBuf {
        self.root.join(LOCKS_DIR)
    }

    pub fn persistent(&self) -> PathBuf {
        self.root.join(PERSISTENT_DIR)
    }

    pub fn disabled(&self) -> PathBuf {
        self.root.join(DISABLED_DIR)
    }
}

/// File name used for per-application state, safe for any bundle identifier
pub fn app_file_stem(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
