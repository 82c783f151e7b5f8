//! Process Reloader
//!
//! After a commit the running copy of the application still has the old
//! executable mapped. The reloader terminates it (and optionally a companion
//! daemon) so the next launch loads the patched binary. Nothing here can fail
//! the injection: problems come back as warnings in the [`ReloadReport`].

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use sysinfo::{Pid, ProcessRefreshKind, Signal, System, UpdateKind};

use crate::directory::ApplicationRecord;
use crate::error::{GraftError, Result};

/// A running process as seen by a [`ProcessDirectory`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
    pub name: String,
    pub executable: Option<PathBuf>,
}

/// Read access to the process table plus the ability to signal
pub trait ProcessDirectory: Send + Sync {
    /// Processes running `executable`
    fn find_processes(&self, executable: &Path) -> Vec<ProcessHandle>;

    /// Processes whose name is exactly `name`
    fn find_by_name(&self, name: &str) -> Vec<ProcessHandle>;

    /// Ask (`soft`) or force a process to exit
    fn terminate(&self, handle: &ProcessHandle, soft: bool) -> Result<()>;
}

/// Process table of the local machine
#[derive(Debug)]
pub struct SystemProcesses {
    system: Mutex<System>,
}

impl SystemProcesses {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn snapshot(&self) -> Vec<ProcessHandle> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet),
        );
        system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessHandle {
                pid: pid.as_u32(),
                name: process.name().to_string(),
                executable: process.exe().map(Path::to_path_buf),
            })
            .collect()
    }
}

impl Default for SystemProcesses {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessDirectory for SystemProcesses {
    fn find_processes(&self, executable: &Path) -> Vec<ProcessHandle> {
        let file_name = executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        self.snapshot()
            .into_iter()
            .filter(|p| match &p.executable {
                Some(exe) => exe == executable,
                // Without an exe path (no permission) fall back to the process name
                None => file_name.as_deref() == Some(p.name.as_str()),
            })
            .collect()
    }

    fn find_by_name(&self, name: &str) -> Vec<ProcessHandle> {
        self.snapshot()
            .into_iter()
            .filter(|p| p.name == name)
            .collect()
    }

    fn terminate(&self, handle: &ProcessHandle, soft: bool) -> Result<()> {
        let system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(process) = system.process(Pid::from_u32(handle.pid)) else {
            // Already gone
            return Ok(());
        };
        let delivered = if soft {
            process
                .kill_with(Signal::Term)
                .unwrap_or_else(|| process.kill())
        } else {
            process.kill()
        };
        if delivered {
            Ok(())
        } else {
            Err(GraftError::IoError {
                message: format!("could not signal {} ({})", handle.name, handle.pid),
            })
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReloadOptions {
    pub soft: bool,
    pub companion_daemon: Option<String>,
}

/// What a reload did
#[derive(Debug, Clone, Default)]
pub struct ReloadReport {
    pub terminated: Vec<ProcessHandle>,
    pub warnings: Vec<String>,
}

impl ReloadReport {
    fn warn(&mut self, message: String) {
        log::warn!("{message}");
        self.warnings.push(message);
    }
}

pub struct ProcessReloader {
    processes: Box<dyn ProcessDirectory>,
}

impl ProcessReloader {
    pub fn new(processes: Box<dyn ProcessDirectory>) -> Self {
        Self { processes }
    }

    /// Terminate running instances of `app` so the patched executable is used
    pub fn reload(&self, app: &ApplicationRecord, options: &ReloadOptions) -> ReloadReport {
        let mut report = ReloadReport::default();

        let running = self.processes.find_processes(&app.executable);
        if running.is_empty() {
            log::info!("{} is not running", app.id);
        }
        for handle in running {
            self.terminate(&handle, options.soft, &mut report);
        }

        if let Some(daemon) = &options.companion_daemon {
            let instances = self.processes.find_by_name(daemon);
            if instances.is_empty() {
                report.warn(format!(
                    "companion daemon {daemon} is not running; restart it manually"
                ));
            }
            for handle in instances {
                self.terminate(&handle, options.soft, &mut report);
            }
        }
        report
    }

    fn terminate(&self, handle: &ProcessHandle, soft: bool, report: &mut ReloadReport) {
        match self.processes.terminate(handle, soft) {
            Ok(()) => {
                log::info!("terminated {} ({})", handle.name, handle.pid);
                report.terminated.push(handle.clone());
            }
            Err(e) => report.warn(format!(
                "could not terminate {} ({}): {e}; relaunch it manually",
                handle.name, handle.pid
            )),
        }
    }
}
