//! Bundle Inspector
//!
//! Reads an application's on-disk state without touching it: the record from
//! the [`ApplicationDirectory`], the executable's load command tables, and the
//! attachment manifest. [`Inspector::survey`] reports what it finds, problems
//! included; [`Inspector::inspect`] turns any problem into an error so the
//! coordinator never patches an application it cannot reason about.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;

use crate::config::EligibilityPolicy;
use crate::directory::{ApplicationDirectory, ApplicationRecord, ApplicationType};
use crate::error::fs::read_failed;
use crate::error::{GraftError, Result};
use crate::patcher::{self, SliceSummary};
use crate::store::{Manifest, ModuleStore, StagedDrift, is_module_reference};

/// Whether the application may be patched, and why not
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Ineligible(String),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

/// A disagreement between the executable and the manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Divergence {
    /// Injected load command with no manifest entry
    Unrecorded { reference: String },
    /// Manifest entry whose load command is gone
    Unlinked { module: String, reference: String },
    /// Architecture slices carry different injected references
    SliceMismatch,
    /// Staged copy no longer matches its recorded hash
    Staged { module: String, drift: StagedDrift },
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Divergence::Unrecorded { reference } => {
                write!(f, "load command {reference} is not in the manifest")
            }
            Divergence::Unlinked { module, reference } => {
                write!(f, "{module} is attached but {reference} is not linked")
            }
            Divergence::SliceMismatch => {
                f.write_str("architecture slices disagree on injected load commands")
            }
            Divergence::Staged { module, drift } => match drift {
                StagedDrift::Missing => write!(f, "staged copy of {module} is missing"),
                StagedDrift::HashMismatch { .. } => {
                    write!(f, "staged copy of {module} was modified")
                }
            },
        }
    }
}

/// Snapshot of one application as the inspector saw it
#[derive(Debug, Clone)]
pub struct Inspection {
    pub record: ApplicationRecord,
    /// Executable bytes the slices were parsed from
    pub executable: Vec<u8>,
    /// Empty when the load command table could not be parsed
    pub slices: Vec<SliceSummary>,
    /// Injected load command paths found in the executable
    pub references: BTreeSet<String>,
    pub manifest: Manifest,
    pub eligibility: Eligibility,
    pub divergences: Vec<Divergence>,
}

impl Inspection {
    pub fn is_consistent(&self) -> bool {
        self.divergences.is_empty()
    }

    /// Fail closed on ineligibility or divergence
    fn into_checked(self) -> Result<Self> {
        if let Eligibility::Ineligible(reason) = &self.eligibility {
            return Err(GraftError::Ineligible {
                id: self.record.id.clone(),
                reason: reason.clone(),
            });
        }
        if !self.divergences.is_empty() {
            let detail = self
                .divergences
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(GraftError::IntegrityMismatch {
                id: self.record.id.clone(),
                detail,
            });
        }
        Ok(self)
    }
}

pub struct Inspector<'a> {
    directory: &'a dyn ApplicationDirectory,
    store: &'a ModuleStore,
    policy: &'a EligibilityPolicy,
}

impl<'a> Inspector<'a> {
    pub fn new(
        directory: &'a dyn ApplicationDirectory,
        store: &'a ModuleStore,
        policy: &'a EligibilityPolicy,
    ) -> Self {
        Self {
            directory,
            store,
            policy,
        }
    }

    /// Validate an application for patching
    ///
    /// Fails with `Ineligible` or `IntegrityMismatch` instead of reporting them.
    pub fn inspect(&self, id: &str) -> Result<Inspection> {
        self.survey(id)?.into_checked()
    }

    /// Describe an application, reporting eligibility and divergences as data
    ///
    /// Still fails for applications that cannot be described at all: unknown
    /// identifier, unreadable or missing executable.
    pub fn survey(&self, id: &str) -> Result<Inspection> {
        let record = self.directory.lookup(id)?;
        let executable = read_executable(&record)?;
        let manifest = self.store.load_manifest(&record.id)?;

        let (slices, parse_problem) = match patcher::summarize(&executable) {
            Ok(slices) => (slices, None),
            Err(
                e @ (GraftError::MalformedBinary { .. }
                | GraftError::UnsupportedArchitecture { .. }),
            ) => (Vec::new(), Some(e.to_string())),
            Err(e) => return Err(e),
        };

        let eligibility = match parse_problem {
            Some(reason) => Eligibility::Ineligible(reason),
            None => self.eligibility(&record, &slices)?,
        };

        let (references, mut divergences) = injected_references(&slices);
        divergences.extend(cross_check(&references, &manifest));

        Ok(Inspection {
            record,
            executable,
            slices,
            references,
            manifest,
            eligibility,
            divergences,
        })
    }

    /// [`survey`](Self::survey) plus a content check of every staged module
    ///
    /// Disabled modules are not staged and are skipped.
    pub fn verify(&self, id: &str) -> Result<Inspection> {
        let mut inspection = self.survey(id)?;
        for attachment in inspection.manifest.attachments.iter().filter(|a| a.enabled) {
            if let Some(drift) = ModuleStore::check(&inspection.record, attachment)? {
                inspection.divergences.push(Divergence::Staged {
                    module: attachment.name.clone(),
                    drift,
                });
            }
        }
        Ok(inspection)
    }

    fn eligibility(
        &self,
        record: &ApplicationRecord,
        slices: &[SliceSummary],
    ) -> Result<Eligibility> {
        let ineligible =
            |reason: &str| -> Result<Eligibility> { Ok(Eligibility::Ineligible(reason.to_string())) };

        if is_read_only(&record.bundle_root)? {
            return ineligible("bundle directory is not writable");
        }
        if is_read_only(&record.executable)? {
            return ineligible("executable is not writable");
        }

        if record.kind == ApplicationType::System {
            let flags = record.flags;
            if flags.removed_system_app {
                if !self.policy.allow_removed_system_apps {
                    return ineligible("removed system applications are not allowed by policy");
                }
            } else if flags.removable_system_app {
                if !self.policy.allow_removable_system_apps {
                    return ineligible("removable system applications are not allowed by policy");
                }
            } else {
                return ineligible("protected system application");
            }
        }

        if record.flags.restricted && !self.policy.allow_restricted {
            return ineligible("restricted application");
        }
        if slices.iter().any(|s| s.encrypted) {
            return ineligible("executable is encrypted");
        }
        Ok(Eligibility::Eligible)
    }
}

fn read_executable(record: &ApplicationRecord) -> Result<Vec<u8>> {
    let invalid = |reason: String| GraftError::InvalidBundle {
        path: record.bundle_root.display().to_string(),
        reason,
    };

    let data = fs::read(&record.executable).map_err(|e| {
        match read_failed(&record.executable, e) {
            GraftError::FileNotFound { path } => invalid(format!("no executable at {path}")),
            other => other,
        }
    })?;
    if !patcher::is_mach_o(&data) {
        return Err(invalid(format!(
            "{} is not a Mach-O executable",
            record.executable.display()
        )));
    }
    Ok(data)
}

fn is_read_only(path: &std::path::Path) -> Result<bool> {
    let metadata = fs::metadata(path).map_err(|e| read_failed(path, e))?;
    Ok(metadata.permissions().readonly())
}

/// Injected references of the executable; every slice must agree
fn injected_references(slices: &[SliceSummary]) -> (BTreeSet<String>, Vec<Divergence>) {
    let per_slice: Vec<BTreeSet<String>> = slices
        .iter()
        .map(|slice| {
            slice
                .references
                .iter()
                .filter(|r| is_module_reference(&r.path))
                .map(|r| r.path.clone())
                .collect()
        })
        .collect();

    let mut divergences = Vec::new();
    if per_slice.windows(2).any(|pair| pair[0] != pair[1]) {
        divergences.push(Divergence::SliceMismatch);
    }
    let union = per_slice.into_iter().flatten().collect();
    (union, divergences)
}

fn cross_check(references: &BTreeSet<String>, manifest: &Manifest) -> Vec<Divergence> {
    let recorded = manifest.references();
    let mut divergences: Vec<Divergence> = references
        .difference(&recorded)
        .map(|reference| Divergence::Unrecorded {
            reference: reference.clone(),
        })
        .collect();

    for attachment in manifest.attachments.iter().filter(|a| a.enabled) {
        let Some(reference) = &attachment.reference else {
            continue;
        };
        if !references.contains(reference) {
            divergences.push(Divergence::Unlinked {
                module: attachment.name.clone(),
                reference: reference.clone(),
            });
        }
    }
    divergences
}
