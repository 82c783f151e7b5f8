//! Injection Coordinator
//!
//! The only component that mutates application bundles. Every `apply` or
//! `remove` runs as one [`Transaction`] under a per-application lock:
//!
//! ```text
//! Created ─► BackedUp ─► Patching ─► Staging ─► Committing ─► Committed
//!    │           │           │          │           │
//!    └───────────┴───────────┴──────────┴───────────┴─► RollingBack ─► RolledBack
//! ```
//!
//! Validation failures in `Created` are returned as they are. Anything that
//! goes wrong after the backup rolls the bundle back and surfaces as a single
//! `TransactionAborted` carrying the cause.
//!
//! Besides the bundle, a transaction may touch two per-application stores in
//! the state directory: persisted copies of injected sources, used to inject
//! again after an app update, and the staged copies of disabled modules.

pub mod lock;
pub mod transaction;

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::{Settings, StateDir};
use crate::directory::{ApplicationDirectory, ApplicationRecord, ApplicationSummary};
use crate::error::fs::write_failed;
use crate::error::{GraftError, Result};
use crate::inspector::{Divergence, Eligibility, Inspection, Inspector};
use crate::patcher;
use crate::reloader::{ProcessDirectory, ProcessReloader, ReloadOptions, ReloadReport, SystemProcesses};
use crate::signer::{self, Signer};
use crate::store::{
    AssetStore, Attachment, InjectableModule, MODULES_DIR, ModuleStore, StagedDrift,
};

use lock::LockRegistry;
pub use transaction::{Phase, Transaction};

/// Cooperative cancellation for an in-flight operation
///
/// Honored in `Created`, `BackedUp` and `Patching`; once staging starts the
/// transaction runs to commit or rollback. A cancellation is consumed by the
/// first operation that observes it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Per-request switches
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Insert weak load commands
    pub weak: bool,
    /// Terminate running instances after commit
    pub reload: bool,
    /// Keep persisted copies of ejected modules
    pub keep_persisted: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            weak: false,
            reload: true,
            keep_persisted: false,
        }
    }
}

/// Result of a committed apply or remove
#[derive(Debug, Clone)]
pub struct Outcome {
    pub application: ApplicationSummary,
    pub attached: Vec<Attachment>,
    pub detached: Vec<Attachment>,
    pub enabled: Vec<Attachment>,
    pub disabled: Vec<Attachment>,
    pub signed: bool,
    pub reload: Option<ReloadReport>,
    pub warnings: Vec<String>,
}

impl Outcome {
    fn new(record: &ApplicationRecord) -> Self {
        Self {
            application: record.summary(),
            attached: Vec::new(),
            detached: Vec::new(),
            enabled: Vec::new(),
            disabled: Vec::new(),
            signed: false,
            reload: None,
            warnings: Vec::new(),
        }
    }
}

/// What a recovery sweep did
///
/// One application's journal failing to roll back does not stop the others.
#[derive(Debug, Default)]
pub struct Recovery {
    pub recovered: Vec<String>,
    pub failed: Vec<(String, GraftError)>,
}

enum Selection {
    Named(Vec<String>),
    All,
}

pub struct Coordinator {
    directory: Box<dyn ApplicationDirectory>,
    store: ModuleStore,
    persistent: AssetStore,
    disabled: AssetStore,
    state: StateDir,
    settings: Settings,
    signer: Box<dyn Signer>,
    reloader: ProcessReloader,
    locks: LockRegistry,
    cancel: CancelToken,
    recovered: Recovery,
}

impl Coordinator {
    /// Build a coordinator and roll back any abandoned transactions
    ///
    /// Journals that cannot be rolled back are reported by
    /// [`recovery_failures`](Self::recovery_failures) and block only their own
    /// application until recovered.
    pub fn new(
        directory: Box<dyn ApplicationDirectory>,
        state: StateDir,
        settings: Settings,
    ) -> Result<Self> {
        let mut coordinator = Self {
            store: ModuleStore::new(state.manifests()),
            persistent: AssetStore::new(state.persistent()),
            disabled: AssetStore::new(state.disabled()),
            signer: signer::from_settings(&settings.signer),
            reloader: ProcessReloader::new(Box::new(SystemProcesses::new())),
            locks: LockRegistry::new(),
            cancel: CancelToken::default(),
            recovered: Recovery::default(),
            directory,
            state,
            settings,
        };
        coordinator.recovered = coordinator.recover()?;
        let recovery = &coordinator.recovered;
        if !recovery.recovered.is_empty() {
            log::warn!(
                "rolled back interrupted transactions for {}",
                recovery.recovered.join(", ")
            );
        }
        for (id, err) in &recovery.failed {
            log::warn!("could not recover {id}: {err}");
        }
        Ok(coordinator)
    }

    /// Applications rolled back while this coordinator was starting
    pub fn recovered_on_start(&self) -> &[String] {
        &self.recovered.recovered
    }

    /// Applications whose abandoned transaction could not be rolled back at start
    pub fn recovery_failures(&self) -> &[(String, GraftError)] {
        &self.recovered.failed
    }

    pub fn with_signer(mut self, signer: Box<dyn Signer>) -> Self {
        self.signer = signer;
        self
    }

    pub fn with_processes(mut self, processes: Box<dyn ProcessDirectory>) -> Self {
        self.reloader = ProcessReloader::new(processes);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn inspector(&self) -> Inspector<'_> {
        Inspector::new(
            self.directory.as_ref(),
            &self.store,
            &self.settings.eligibility,
        )
    }

    pub fn list_applications(&self) -> Result<Vec<ApplicationSummary>> {
        self.directory.list_applications()
    }

    pub fn list_attachments(&self, id: &str) -> Result<Vec<Attachment>> {
        let record = self.directory.lookup(id)?;
        self.store.list_attachments(&record.id)
    }

    /// Persisted module copies of application `id`
    pub fn persisted_assets(&self, id: &str) -> Result<Vec<PathBuf>> {
        let record = self.directory.lookup(id)?;
        self.persistent.list(&record.id)
    }

    /// Describe an application without validating it
    pub fn describe(&self, id: &str) -> Result<Inspection> {
        self.inspector().survey(id)
    }

    /// Check the executable, manifest and staged copies against each other
    pub fn verify(&self, id: &str) -> Result<Inspection> {
        let _lock = self.locks.acquire(id, &self.state.locks())?;
        self.recover_app(id)?;
        self.inspector().verify(id)
    }

    /// Roll back every abandoned transaction
    ///
    /// Fails only when the transactions directory itself cannot be read.
    pub fn recover(&self) -> Result<Recovery> {
        let mut recovery = Recovery::default();
        for id in transaction::pending(&self.state.transactions())? {
            let result = self
                .locks
                .acquire(&id, &self.state.locks())
                .and_then(|_lock| transaction::recover(&self.state.transactions(), &id));
            match result {
                Ok(true) => recovery.recovered.push(id),
                Ok(false) => {}
                Err(err) => recovery.failed.push((id, err)),
            }
        }
        Ok(recovery)
    }

    fn recover_app(&self, id: &str) -> Result<()> {
        if transaction::recover(&self.state.transactions(), id)? {
            log::warn!("rolled back an interrupted transaction for {id}");
        }
        Ok(())
    }

    /// Inject the modules at `sources` into application `id`
    pub fn apply(&self, id: &str, sources: &[PathBuf], options: Options) -> Result<Outcome> {
        let _lock = self.locks.acquire(id, &self.state.locks())?;
        self.recover_app(id)?;

        log::debug!("{id}: {:?}", Phase::Created);
        let inspection = self.inspector().inspect(id)?;
        let record = &inspection.record;
        let modules = self.resolve_modules(&inspection, sources)?;
        self.checkpoint(Phase::Created)?;

        let mut tx = Transaction::begin(
            &self.state.transactions(),
            record,
            &self.store.manifest_path(&record.id),
        )
        .map_err(|e| GraftError::aborted(id, e))?;

        let mut outcome = Outcome::new(record);
        let weak = options.weak || self.settings.weak_references;
        match self.run_apply(&mut tx, &inspection, &modules, weak, &mut outcome) {
            Ok(()) => tx.commit().map_err(|e| GraftError::aborted(id, e))?,
            Err(cause) => return Err(abort(tx, cause)),
        }
        log::info!(
            "injected {} module(s) into {}",
            outcome.attached.len(),
            record.id
        );

        self.finish(record, options, &mut outcome);
        Ok(outcome)
    }

    /// Detach the named modules from application `id`
    pub fn remove(&self, id: &str, names: &[String], options: Options) -> Result<Outcome> {
        self.remove_selected(id, Selection::Named(names.to_vec()), options)
    }

    /// Detach every attached module from application `id`
    pub fn remove_all(&self, id: &str, options: Options) -> Result<Outcome> {
        self.remove_selected(id, Selection::All, options)
    }

    fn remove_selected(&self, id: &str, selection: Selection, options: Options) -> Result<Outcome> {
        let _lock = self.locks.acquire(id, &self.state.locks())?;
        self.recover_app(id)?;

        log::debug!("{id}: {:?}", Phase::Created);
        let inspection = self.inspector().inspect(id)?;
        let record = &inspection.record;
        let all = matches!(selection, Selection::All);
        let attachments = select_attachments(&inspection, selection)?;
        let mut outcome = Outcome::new(record);
        if attachments.is_empty() {
            log::info!("nothing attached to {}", record.id);
            return Ok(outcome);
        }

        // Persisted copies to drop along with the attachments
        let mut desisted = BTreeSet::new();
        if !options.keep_persisted {
            desisted.extend(attachments.iter().map(|a| a.name.clone()));
            if all {
                desisted.extend(self.persistent.list(&record.id)?.iter().filter_map(|p| {
                    p.file_name().map(|n| n.to_string_lossy().into_owned())
                }));
            }
        }
        self.checkpoint(Phase::Created)?;

        let mut tx = Transaction::begin(
            &self.state.transactions(),
            record,
            &self.store.manifest_path(&record.id),
        )
        .map_err(|e| GraftError::aborted(id, e))?;

        match self.run_remove(&mut tx, &inspection, &attachments, &desisted, &mut outcome) {
            Ok(()) => tx.commit().map_err(|e| GraftError::aborted(id, e))?,
            Err(cause) => return Err(abort(tx, cause)),
        }
        log::info!(
            "removed {} module(s) from {}",
            outcome.detached.len(),
            record.id
        );

        self.finish(record, options, &mut outcome);
        Ok(outcome)
    }

    /// Unlink the named modules from application `id` without ejecting them
    ///
    /// The staged copies move to the disabled store and the manifest entries
    /// stay, marked disabled. Modules that are already disabled are skipped.
    pub fn disable(&self, id: &str, names: &[String], options: Options) -> Result<Outcome> {
        let _lock = self.locks.acquire(id, &self.state.locks())?;
        self.recover_app(id)?;

        log::debug!("{id}: {:?}", Phase::Created);
        let inspection = self.inspector().inspect(id)?;
        let record = &inspection.record;
        let (targets, skipped): (Vec<_>, Vec<_>) =
            select_attachments(&inspection, Selection::Named(names.to_vec()))?
                .into_iter()
                .partition(|a| a.enabled);
        for attachment in &skipped {
            log::info!("{} is already disabled in {}", attachment.name, record.id);
        }
        let mut outcome = Outcome::new(record);
        if targets.is_empty() {
            return Ok(outcome);
        }
        self.checkpoint(Phase::Created)?;

        let mut tx = Transaction::begin(
            &self.state.transactions(),
            record,
            &self.store.manifest_path(&record.id),
        )
        .map_err(|e| GraftError::aborted(id, e))?;

        match self.run_disable(&mut tx, &inspection, &targets, &mut outcome) {
            Ok(()) => tx.commit().map_err(|e| GraftError::aborted(id, e))?,
            Err(cause) => return Err(abort(tx, cause)),
        }
        log::info!(
            "disabled {} module(s) in {}",
            outcome.disabled.len(),
            record.id
        );

        self.finish(record, options, &mut outcome);
        Ok(outcome)
    }

    /// Link and stage disabled modules of application `id` again
    ///
    /// The staged copy comes from the disabled store, or from the persisted
    /// copy if that one is gone. Either must still match the recorded hash.
    pub fn enable(&self, id: &str, names: &[String], options: Options) -> Result<Outcome> {
        let _lock = self.locks.acquire(id, &self.state.locks())?;
        self.recover_app(id)?;

        log::debug!("{id}: {:?}", Phase::Created);
        let inspection = self.inspector().inspect(id)?;
        let record = &inspection.record;
        let mut targets = Vec::new();
        for attachment in select_attachments(&inspection, Selection::Named(names.to_vec()))? {
            if attachment.enabled {
                log::info!("{} is already enabled in {}", attachment.name, record.id);
                continue;
            }
            let destination = record.bundle_root.join(&attachment.relative_path);
            if fs::symlink_metadata(&destination).is_ok() {
                return Err(write_failed(
                    &destination,
                    "destination already exists in the bundle",
                ));
            }
            let copy = [&self.disabled, &self.persistent]
                .into_iter()
                .map(|assets| assets.path(&record.id, &attachment.name))
                .find(|path| path.exists())
                .ok_or_else(|| GraftError::ModuleNotFound {
                    path: self
                        .disabled
                        .path(&record.id, &attachment.name)
                        .display()
                        .to_string(),
                })?;
            targets.push((attachment, copy));
        }
        let mut outcome = Outcome::new(record);
        if targets.is_empty() {
            return Ok(outcome);
        }
        self.checkpoint(Phase::Created)?;

        let mut tx = Transaction::begin(
            &self.state.transactions(),
            record,
            &self.store.manifest_path(&record.id),
        )
        .map_err(|e| GraftError::aborted(id, e))?;

        let weak = options.weak || self.settings.weak_references;
        match self.run_enable(&mut tx, &inspection, &targets, weak, &mut outcome) {
            Ok(()) => tx.commit().map_err(|e| GraftError::aborted(id, e))?,
            Err(cause) => return Err(abort(tx, cause)),
        }
        log::info!(
            "enabled {} module(s) in {}",
            outcome.enabled.len(),
            record.id
        );

        self.finish(record, options, &mut outcome);
        Ok(outcome)
    }

    /// Inject the persisted copies of application `id` again
    ///
    /// Meant for after an app update replaced the bundle. Attachments whose
    /// load command or staged copy went missing are detached first and
    /// replaced by their persisted copy when there is one. Persisted copies
    /// with no attachment are injected too. Disabled and intact attachments
    /// are left alone.
    pub fn apply_persisted(&self, id: &str, options: Options) -> Result<Outcome> {
        let _lock = self.locks.acquire(id, &self.state.locks())?;
        self.recover_app(id)?;

        log::debug!("{id}: {:?}", Phase::Created);
        let inspection = self.inspector().verify(id)?;
        let record = &inspection.record;
        if let Eligibility::Ineligible(reason) = &inspection.eligibility {
            return Err(GraftError::Ineligible {
                id: record.id.clone(),
                reason: reason.clone(),
            });
        }
        let stale = stale_attachments(&inspection)?;

        let mut modules = Vec::new();
        for path in self.persistent.list(&record.id)? {
            let module = InjectableModule::resolve(&path)?;
            let replaces_stale = stale.iter().any(|a| a.name == module.name);
            if inspection.manifest.contains(&module.name) && !replaces_stale {
                continue;
            }
            let destination = ModuleStore::destination(record, &module);
            if !replaces_stale && fs::symlink_metadata(&destination).is_ok() {
                return Err(write_failed(
                    &destination,
                    "destination already exists in the bundle",
                ));
            }
            modules.push(module);
        }
        let mut outcome = Outcome::new(record);
        if modules.is_empty() && stale.is_empty() {
            log::info!("nothing to restore for {}", record.id);
            return Ok(outcome);
        }
        self.checkpoint(Phase::Created)?;

        let mut tx = Transaction::begin(
            &self.state.transactions(),
            record,
            &self.store.manifest_path(&record.id),
        )
        .map_err(|e| GraftError::aborted(id, e))?;

        let weak = options.weak || self.settings.weak_references;
        match self.run_reapply(&mut tx, &inspection, &stale, &modules, weak, &mut outcome) {
            Ok(()) => tx.commit().map_err(|e| GraftError::aborted(id, e))?,
            Err(cause) => return Err(abort(tx, cause)),
        }
        log::info!(
            "restored {} persisted module(s) into {}",
            outcome.attached.len(),
            record.id
        );

        self.finish(record, options, &mut outcome);
        Ok(outcome)
    }

    fn resolve_modules(
        &self,
        inspection: &Inspection,
        sources: &[PathBuf],
    ) -> Result<Vec<InjectableModule>> {
        let record = &inspection.record;
        if sources.is_empty() {
            return Err(GraftError::ConfigInvalid {
                message: "no modules to inject".to_string(),
            });
        }

        let mut names = BTreeSet::new();
        let mut modules = Vec::with_capacity(sources.len());
        for source in sources {
            let module = InjectableModule::resolve(source)?;
            if !names.insert(module.name.clone()) {
                return Err(GraftError::InvalidModule {
                    path: source.display().to_string(),
                    reason: "given more than once".to_string(),
                });
            }
            if inspection.manifest.contains(&module.name) {
                return Err(GraftError::AlreadyAttached {
                    id: record.id.clone(),
                    module: module.name,
                });
            }
            let destination = ModuleStore::destination(record, &module);
            if fs::symlink_metadata(&destination).is_ok() {
                return Err(write_failed(
                    &destination,
                    "destination already exists in the bundle",
                ));
            }
            modules.push(module);
        }
        Ok(modules)
    }

    fn run_apply(
        &self,
        tx: &mut Transaction,
        inspection: &Inspection,
        modules: &[InjectableModule],
        weak: bool,
        outcome: &mut Outcome,
    ) -> Result<()> {
        let record = &inspection.record;
        self.checkpoint(tx.phase())?;

        tx.advance(Phase::Patching)?;
        let mut patched = inspection.executable.clone();
        for module in modules {
            if let Some(reference) = &module.reference {
                patched = patcher::add_module_reference(&patched, reference, weak)?;
            }
        }
        let patched = self.sign(patched, outcome)?;
        self.checkpoint(tx.phase())?;

        tx.advance(Phase::Staging)?;
        self.stage_modules(tx, record, modules, outcome)?;

        tx.advance(Phase::Committing)?;
        write_executable(&record.executable, &patched)
    }

    /// Copy `modules` into the bundle and keep a persisted copy of each
    fn stage_modules(
        &self,
        tx: &mut Transaction,
        record: &ApplicationRecord,
        modules: &[InjectableModule],
        outcome: &mut Outcome,
    ) -> Result<()> {
        let modules_dir = record.bundle_root.join(MODULES_DIR);
        if modules.iter().any(|m| m.kind.is_linked()) && !modules_dir.exists() {
            tx.track_created(&modules_dir)?;
        }
        for module in modules {
            tx.track_created(&ModuleStore::destination(record, module))?;
            outcome.attached.push(self.store.stage(record, module)?);

            let kept = self.persistent.path(&record.id, &module.name);
            if kept == module.source {
                continue;
            }
            track(tx, &self.persistent, &record.id, &module.name)?;
            self.persistent.keep(&record.id, &module.name, &module.source)?;
        }
        Ok(())
    }

    fn run_remove(
        &self,
        tx: &mut Transaction,
        inspection: &Inspection,
        attachments: &[Attachment],
        desisted: &BTreeSet<String>,
        outcome: &mut Outcome,
    ) -> Result<()> {
        let record = &inspection.record;
        self.checkpoint(tx.phase())?;

        tx.advance(Phase::Patching)?;
        let patched = unlink(&inspection.executable, attachments.iter().filter(|a| a.enabled))?;
        let patched = self.sign(patched, outcome)?;
        self.checkpoint(tx.phase())?;

        tx.advance(Phase::Staging)?;
        for attachment in attachments {
            let copy = if attachment.enabled {
                record.bundle_root.join(&attachment.relative_path)
            } else {
                self.disabled.path(&record.id, &attachment.name)
            };
            tx.preserve(&copy)?;
            outcome.detached.push(self.store.unstage(record, &attachment.name)?);
            if !attachment.enabled {
                self.disabled.discard(&record.id, &attachment.name)?;
            }
        }
        for name in desisted {
            tx.preserve(&self.persistent.path(&record.id, name))?;
            self.persistent.discard(&record.id, name)?;
        }

        tx.advance(Phase::Committing)?;
        write_executable(&record.executable, &patched)?;
        remove_if_empty(&record.bundle_root.join(MODULES_DIR));
        Ok(())
    }

    fn run_disable(
        &self,
        tx: &mut Transaction,
        inspection: &Inspection,
        attachments: &[Attachment],
        outcome: &mut Outcome,
    ) -> Result<()> {
        let record = &inspection.record;
        self.checkpoint(tx.phase())?;

        tx.advance(Phase::Patching)?;
        let patched = unlink(&inspection.executable, attachments)?;
        let patched = self.sign(patched, outcome)?;
        self.checkpoint(tx.phase())?;

        tx.advance(Phase::Staging)?;
        for attachment in attachments {
            let staged = record.bundle_root.join(&attachment.relative_path);
            track(tx, &self.disabled, &record.id, &attachment.name)?;
            self.disabled.keep(&record.id, &attachment.name, &staged)?;
            tx.preserve(&staged)?;
            outcome.disabled.push(self.store.withdraw(record, &attachment.name)?);
        }

        tx.advance(Phase::Committing)?;
        write_executable(&record.executable, &patched)?;
        remove_if_empty(&record.bundle_root.join(MODULES_DIR));
        Ok(())
    }

    fn run_enable(
        &self,
        tx: &mut Transaction,
        inspection: &Inspection,
        targets: &[(Attachment, PathBuf)],
        weak: bool,
        outcome: &mut Outcome,
    ) -> Result<()> {
        let record = &inspection.record;
        self.checkpoint(tx.phase())?;

        tx.advance(Phase::Patching)?;
        let mut patched = inspection.executable.clone();
        for (attachment, _) in targets {
            if let Some(reference) = &attachment.reference {
                patched = patcher::add_module_reference(&patched, reference, weak)?;
            }
        }
        let patched = self.sign(patched, outcome)?;
        self.checkpoint(tx.phase())?;

        tx.advance(Phase::Staging)?;
        let modules_dir = record.bundle_root.join(MODULES_DIR);
        if targets.iter().any(|(a, _)| a.kind.is_linked()) && !modules_dir.exists() {
            tx.track_created(&modules_dir)?;
        }
        for (attachment, copy) in targets {
            tx.track_created(&record.bundle_root.join(&attachment.relative_path))?;
            outcome.enabled.push(self.store.restage(record, &attachment.name, copy)?);
            if self.disabled.contains(&record.id, &attachment.name) {
                tx.preserve(copy)?;
                self.disabled.discard(&record.id, &attachment.name)?;
            }
        }

        tx.advance(Phase::Committing)?;
        write_executable(&record.executable, &patched)
    }

    fn run_reapply(
        &self,
        tx: &mut Transaction,
        inspection: &Inspection,
        stale: &[Attachment],
        modules: &[InjectableModule],
        weak: bool,
        outcome: &mut Outcome,
    ) -> Result<()> {
        let record = &inspection.record;
        self.checkpoint(tx.phase())?;

        tx.advance(Phase::Patching)?;
        let linked = stale.iter().filter(|a| {
            a.reference
                .as_ref()
                .is_some_and(|r| inspection.references.contains(r))
        });
        let mut patched = unlink(&inspection.executable, linked)?;
        for module in modules {
            if let Some(reference) = &module.reference {
                patched = patcher::add_module_reference(&patched, reference, weak)?;
            }
        }
        let patched = self.sign(patched, outcome)?;
        self.checkpoint(tx.phase())?;

        tx.advance(Phase::Staging)?;
        for attachment in stale {
            tx.preserve(&record.bundle_root.join(&attachment.relative_path))?;
            let detached = self.store.unstage(record, &attachment.name)?;
            if !modules.iter().any(|m| m.name == detached.name) {
                let warning = format!("dropped {}: no persisted copy to restore", detached.name);
                log::warn!("{warning}");
                outcome.warnings.push(warning);
                outcome.detached.push(detached);
            }
        }
        self.stage_modules(tx, record, modules, outcome)?;

        tx.advance(Phase::Committing)?;
        write_executable(&record.executable, &patched)
    }

    /// Re-sign the patched executable; a missing signer is only a warning
    fn sign(&self, patched: Vec<u8>, outcome: &mut Outcome) -> Result<Vec<u8>> {
        match self.signer.sign(&patched) {
            Ok(signed) => {
                // The signer must hand back something we can still parse.
                patcher::summarize(&signed)?;
                outcome.signed = true;
                Ok(signed)
            }
            Err(GraftError::SigningUnavailable { reason })
                if !self.settings.eligibility.require_signature =>
            {
                let warning = format!("executable left unsigned: {reason}");
                log::warn!("{warning}");
                outcome.warnings.push(warning);
                Ok(patched)
            }
            Err(e) => Err(e),
        }
    }

    fn checkpoint(&self, phase: Phase) -> Result<()> {
        if phase.is_cancellable() && self.cancel.take() {
            log::info!("cancelled in {phase:?}");
            return Err(GraftError::Cancelled);
        }
        Ok(())
    }

    fn finish(&self, record: &ApplicationRecord, options: Options, outcome: &mut Outcome) {
        if !options.reload || !self.settings.reload.enabled {
            return;
        }
        let report = self.reloader.reload(
            record,
            &ReloadOptions {
                soft: self.settings.reload.soft,
                companion_daemon: self.settings.reload.companion_daemon.clone(),
            },
        );
        outcome.warnings.extend(report.warnings.iter().cloned());
        outcome.reload = Some(report);
    }
}

/// Roll back `tx` and produce the error the caller sees
fn abort(tx: Transaction, cause: GraftError) -> GraftError {
    let id = tx.application().to_string();
    log::debug!("{id}: aborting in {:?}: {cause}", tx.phase());
    match tx.rollback() {
        Ok(()) => {
            log::debug!("{id}: {:?}", Phase::RolledBack);
            GraftError::aborted(id, cause)
        }
        Err(rollback) => {
            log::error!("{id}: rollback after '{cause}' failed");
            rollback
        }
    }
}

fn select_attachments(inspection: &Inspection, selection: Selection) -> Result<Vec<Attachment>> {
    let manifest = &inspection.manifest;
    match selection {
        Selection::All => Ok(manifest.attachments.clone()),
        Selection::Named(names) => {
            let mut seen = BTreeSet::new();
            let mut selected = Vec::new();
            for name in names {
                let attachment = manifest.find(&name).ok_or_else(|| GraftError::NotAttached {
                    id: inspection.record.id.clone(),
                    module: name.clone(),
                })?;
                if seen.insert(name) {
                    selected.push(attachment.clone());
                }
            }
            Ok(selected)
        }
    }
}

/// Enabled attachments that lost their load command or staged copy
///
/// Any other divergence means the bundle is in a state nothing here can
/// repair, and is returned as `IntegrityMismatch`.
fn stale_attachments(inspection: &Inspection) -> Result<Vec<Attachment>> {
    let mut stale = BTreeSet::new();
    let mut unexpected = Vec::new();
    for divergence in &inspection.divergences {
        match divergence {
            Divergence::Unlinked { module, .. }
            | Divergence::Staged {
                module,
                drift: StagedDrift::Missing,
            } => {
                stale.insert(module.clone());
            }
            other => unexpected.push(other.to_string()),
        }
    }
    if !unexpected.is_empty() {
        return Err(GraftError::IntegrityMismatch {
            id: inspection.record.id.clone(),
            detail: unexpected.join("; "),
        });
    }
    Ok(inspection
        .manifest
        .attachments
        .iter()
        .filter(|a| stale.contains(&a.name))
        .cloned()
        .collect())
}

/// Drop the load commands of `attachments` from `executable`
fn unlink<'a>(
    executable: &[u8],
    attachments: impl IntoIterator<Item = &'a Attachment>,
) -> Result<Vec<u8>> {
    let mut patched = executable.to_vec();
    for attachment in attachments {
        if let Some(reference) = &attachment.reference {
            patched = patcher::remove_module_reference(&patched, reference)?;
        }
    }
    Ok(patched)
}

/// Record `name` in `assets` with the transaction before it is overwritten
fn track(tx: &mut Transaction, assets: &AssetStore, app_id: &str, name: &str) -> Result<()> {
    let path = assets.path(app_id, name);
    if assets.contains(app_id, name) {
        tx.preserve(&path)
    } else {
        tx.track_created(&path)
    }
}

fn write_executable(path: &Path, bytes: &[u8]) -> Result<()> {
    let permissions = fs::metadata(path)
        .map_err(|e| write_failed(path, e))?
        .permissions();
    transaction::write_atomic(path, bytes, permissions).map_err(|e| write_failed(path, e))
}

fn remove_if_empty(dir: &Path) {
    let empty = fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_none());
    if !empty {
        return;
    }
    if let Err(e) = fs::remove_dir(dir) {
        log::debug!("could not remove {}: {e}", dir.display());
    }
}

#[cfg(test)]
mod tests;
