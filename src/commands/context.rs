//! Builds the coordinator every command works through
//!
//! Precedence for each location: command line flag, then environment
//! variable (both handled by clap), then the built-in default.

use std::path::PathBuf;

use crate::cli::GlobalArgs;
use crate::config::{DEFAULT_APPS_ROOT, DEFAULT_SYSTEM_APPS_ROOT, Settings, StateDir};
use crate::coordinator::Coordinator;
use crate::directory::FsDirectory;
use crate::error::{GraftError, Result};

pub fn state_dir(global: &GlobalArgs) -> Result<StateDir> {
    match &global.state_dir {
        Some(dir) => Ok(StateDir::new(dir)),
        None => StateDir::default_location(),
    }
}

pub fn settings(global: &GlobalArgs, state: &StateDir) -> Result<Settings> {
    match &global.config {
        // An explicitly named file has to exist
        Some(path) if !path.is_file() => Err(GraftError::FileNotFound {
            path: path.display().to_string(),
        }),
        Some(path) => Settings::load(path),
        None => Settings::load(&state.settings_file()),
    }
}

pub fn coordinator(global: &GlobalArgs) -> Result<Coordinator> {
    let state = state_dir(global)?;
    let settings = settings(global, &state)?;
    let apps_root = global
        .apps_root
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_APPS_ROOT));
    let system_apps_root = global
        .system_apps_root
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SYSTEM_APPS_ROOT));
    log::debug!(
        "apps root {}, system apps root {}, state {}",
        apps_root.display(),
        system_apps_root.display(),
        state.root().display()
    );

    let directory = FsDirectory::new(apps_root, Some(system_apps_root));
    Coordinator::new(Box::new(directory), state, settings)
}
