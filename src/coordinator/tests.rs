//! Tests for the injection coordinator

use super::*;
use crate::config::EligibilityPolicy;
use crate::directory::FsDirectory;
use crate::reloader::ProcessHandle;
use crate::reloader::tests::FakeProcesses;
use crate::store::Manifest;
use crate::test_fixtures::{MachOBuilder, fat_binary, write_app, write_dylib};
use std::thread;
use tempfile::TempDir;

const APP: &str = "com.example.demo";

struct Device {
    temp: TempDir,
    app: PathBuf,
}

impl Device {
    fn new(executable: &[u8]) -> Self {
        let temp = TempDir::new().unwrap();
        let app = write_app(&temp.path().join("Bundle"), "AAAA", APP, "Demo", executable);
        fs::create_dir_all(temp.path().join("modules")).unwrap();
        Self { temp, app }
    }

    fn executable(&self) -> PathBuf {
        self.app.join("Demo")
    }

    fn state(&self) -> StateDir {
        StateDir::new(self.temp.path().join("state"))
    }

    fn dylib(&self, name: &str) -> PathBuf {
        write_dylib(&self.temp.path().join("modules"), name)
    }

    fn coordinator(&self, settings: Settings) -> Coordinator {
        Coordinator::new(
            Box::new(FsDirectory::new(self.temp.path().join("Bundle"), None)),
            self.state(),
            settings,
        )
        .unwrap()
        .with_processes(Box::new(FakeProcesses::default()))
    }

    fn manifest(&self) -> Manifest {
        ModuleStore::new(self.state().manifests()).load_manifest(APP).unwrap()
    }

    fn journal_dir(&self) -> PathBuf {
        self.state().transactions().join(APP)
    }
}

/// Signer that runs a side effect and then hands the buffer back unchanged
struct Hook<F: Fn() + Send + Sync>(F);

impl<F: Fn() + Send + Sync> Signer for Hook<F> {
    fn sign(&self, executable: &[u8]) -> Result<Vec<u8>> {
        (self.0)();
        Ok(executable.to_vec())
    }
}

struct Failing;

impl Signer for Failing {
    fn sign(&self, _executable: &[u8]) -> Result<Vec<u8>> {
        Err(GraftError::SigningFailed {
            reason: "bad certificate".to_string(),
        })
    }
}

fn references(path: &Path) -> BTreeSet<String> {
    patcher::summarize(&fs::read(path).unwrap()).unwrap()[0]
        .references
        .iter()
        .map(|r| r.path.clone())
        .collect()
}

fn cause(err: GraftError) -> GraftError {
    match err {
        GraftError::TransactionAborted { cause, .. } => *cause,
        other => panic!("expected TransactionAborted, got {other:?}"),
    }
}

#[test]
fn test_apply_list_remove_round_trip() {
    let device = Device::new(&MachOBuilder::arm64().build());
    let original = fs::read(device.executable()).unwrap();
    let before = references(&device.executable());
    let coordinator = device.coordinator(Settings::default());

    let outcome = coordinator
        .apply(APP, &[device.dylib("Tweak.dylib")], Options::default())
        .unwrap();
    assert_eq!(outcome.attached.len(), 1);
    assert!(!outcome.signed);
    assert!(outcome.warnings.iter().any(|w| w.contains("unsigned")));

    let attachments = coordinator.list_attachments(APP).unwrap();
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].name, "Tweak.dylib");
    assert!(device.app.join("GraftModules/Tweak.dylib").is_file());

    let after = references(&device.executable());
    assert_eq!(after.len(), before.len() + 1);
    assert!(after.contains("@executable_path/GraftModules/Tweak.dylib"));

    coordinator
        .remove(APP, &["Tweak.dylib".to_string()], Options::default())
        .unwrap();
    assert_eq!(fs::read(device.executable()).unwrap(), original);
    assert!(coordinator.list_attachments(APP).unwrap().is_empty());
    assert!(!device.app.join("GraftModules").exists());
    assert!(!device.journal_dir().exists());
}

#[test]
fn test_manifest_matches_executable_after_commit() {
    let device = Device::new(&fat_binary(&[
        MachOBuilder::armv7().build(),
        MachOBuilder::arm64().build(),
    ]));
    let coordinator = device.coordinator(Settings::default());
    coordinator
        .apply(
            APP,
            &[device.dylib("A.dylib"), device.dylib("B.dylib")],
            Options::default(),
        )
        .unwrap();

    let inspection = coordinator.verify(APP).unwrap();
    assert!(inspection.is_consistent());
    assert_eq!(inspection.references, device.manifest().references());
    assert_eq!(inspection.slices.len(), 2);
    for slice in &inspection.slices {
        assert_eq!(
            slice
                .references
                .iter()
                .filter(|r| r.path.starts_with("@executable_path/GraftModules/"))
                .count(),
            2
        );
    }
}

#[test]
fn test_apply_twice_is_already_attached() {
    let device = Device::new(&MachOBuilder::arm64().build());
    let coordinator = device.coordinator(Settings::default());
    let tweak = device.dylib("Tweak.dylib");
    coordinator.apply(APP, &[tweak.clone()], Options::default()).unwrap();
    let patched = fs::read(device.executable()).unwrap();

    let err = coordinator.apply(APP, &[tweak], Options::default()).unwrap_err();
    assert!(matches!(err, GraftError::AlreadyAttached { .. }));
    assert_eq!(fs::read(device.executable()).unwrap(), patched);
}

#[test]
fn test_unknown_application_is_not_found() {
    let device = Device::new(&MachOBuilder::arm64().build());
    let coordinator = device.coordinator(Settings::default());
    let err = coordinator
        .apply("com.example.missing", &[device.dylib("T.dylib")], Options::default())
        .unwrap_err();
    assert!(matches!(err, GraftError::ApplicationNotFound { .. }));
}

#[test]
fn test_staging_failure_rolls_back_everything() {
    let device = Device::new(&MachOBuilder::arm64().build());
    let original = fs::read(device.executable()).unwrap();
    let first = device.dylib("First.dylib");
    let second = device.dylib("Second.dylib");

    // Pull the second source out from under the store once patching is done.
    let doomed = second.clone();
    let coordinator = device
        .coordinator(Settings::default())
        .with_signer(Box::new(Hook(move || {
            let _ = fs::remove_file(&doomed);
        })));

    let err = coordinator
        .apply(APP, &[first, second], Options::default())
        .unwrap_err();
    assert!(!err.needs_repair());
    assert!(matches!(cause(err), GraftError::FileWriteFailed { .. }));

    assert_eq!(fs::read(device.executable()).unwrap(), original);
    assert!(!device.app.join("GraftModules").exists());
    assert!(device.manifest().attachments.is_empty());
    assert!(!device.journal_dir().exists());
}

#[test]
fn test_capacity_exceeded_leaves_bundle_untouched() {
    let device = Device::new(&MachOBuilder::arm64().padding(16).build());
    let original = fs::read(device.executable()).unwrap();
    let coordinator = device.coordinator(Settings::default());

    let err = coordinator
        .apply(APP, &[device.dylib("Tweak.dylib")], Options::default())
        .unwrap_err();
    assert!(matches!(cause(err), GraftError::CapacityExceeded { .. }));
    assert_eq!(fs::read(device.executable()).unwrap(), original);
    assert!(!device.journal_dir().exists());
}

#[test]
fn test_signing_failure_aborts() {
    let device = Device::new(&MachOBuilder::arm64().build());
    let original = fs::read(device.executable()).unwrap();
    let coordinator = device
        .coordinator(Settings::default())
        .with_signer(Box::new(Failing));

    let err = coordinator
        .apply(APP, &[device.dylib("Tweak.dylib")], Options::default())
        .unwrap_err();
    assert!(matches!(cause(err), GraftError::SigningFailed { .. }));
    assert_eq!(fs::read(device.executable()).unwrap(), original);
}

#[test]
fn test_required_signature_without_signer_aborts() {
    let device = Device::new(&MachOBuilder::arm64().build());
    let settings = Settings {
        eligibility: EligibilityPolicy {
            require_signature: true,
            ..EligibilityPolicy::default()
        },
        ..Settings::default()
    };
    let coordinator = device.coordinator(settings);

    let err = coordinator
        .apply(APP, &[device.dylib("Tweak.dylib")], Options::default())
        .unwrap_err();
    assert!(matches!(cause(err), GraftError::SigningUnavailable { .. }));
}

#[test]
fn test_cancel_before_start() {
    let device = Device::new(&MachOBuilder::arm64().build());
    let coordinator = device.coordinator(Settings::default());
    coordinator.cancel_token().cancel();

    let err = coordinator
        .apply(APP, &[device.dylib("Tweak.dylib")], Options::default())
        .unwrap_err();
    assert!(matches!(err, GraftError::Cancelled));

    // The cancellation is consumed; the next request runs.
    coordinator
        .apply(APP, &[device.dylib("Tweak.dylib")], Options::default())
        .unwrap();
}

#[test]
fn test_cancel_during_patching_rolls_back() {
    let device = Device::new(&MachOBuilder::arm64().build());
    let original = fs::read(device.executable()).unwrap();
    let coordinator = device.coordinator(Settings::default());
    let trigger = coordinator.cancel_token();
    let coordinator = coordinator.with_signer(Box::new(Hook(move || trigger.cancel())));

    let err = coordinator
        .apply(APP, &[device.dylib("Tweak.dylib")], Options::default())
        .unwrap_err();
    assert!(matches!(cause(err), GraftError::Cancelled));
    assert_eq!(fs::read(device.executable()).unwrap(), original);
    assert!(device.manifest().attachments.is_empty());
}

#[test]
fn test_abandoned_transaction_is_rolled_back_on_start() {
    let device = Device::new(&MachOBuilder::arm64().build());
    let original = fs::read(device.executable()).unwrap();
    let record = FsDirectory::new(device.temp.path().join("Bundle"), None)
        .lookup(APP)
        .unwrap();

    let state = device.state();
    let mut tx = Transaction::begin(
        &state.transactions(),
        &record,
        &state.manifests().join(format!("{APP}.json")),
    )
    .unwrap();
    tx.advance(Phase::Staging).unwrap();
    let staged = device.app.join("GraftModules");
    tx.track_created(&staged).unwrap();
    fs::create_dir_all(&staged).unwrap();
    fs::write(device.executable(), b"half-written").unwrap();
    tx.abandon();

    let coordinator = device.coordinator(Settings::default());
    assert_eq!(coordinator.recovered_on_start(), [APP.to_string()]);
    assert_eq!(fs::read(device.executable()).unwrap(), original);
    assert!(!staged.exists());
    assert!(!device.journal_dir().exists());
}

#[test]
fn test_start_survives_journal_of_uninstalled_app() {
    let device = Device::new(&MachOBuilder::arm64().build());
    let record = FsDirectory::new(device.temp.path().join("Bundle"), None)
        .lookup(APP)
        .unwrap();
    let state = device.state();
    let mut tx = Transaction::begin(
        &state.transactions(),
        &record,
        &state.manifests().join(format!("{APP}.json")),
    )
    .unwrap();
    tx.advance(Phase::Patching).unwrap();
    tx.abandon();
    fs::remove_dir_all(device.temp.path().join("Bundle/AAAA")).unwrap();
    write_app(
        &device.temp.path().join("Bundle"),
        "BBBB",
        "com.example.other",
        "Other",
        &MachOBuilder::arm64().build(),
    );

    let coordinator = device.coordinator(Settings::default());
    assert!(coordinator.recovery_failures().is_empty());
    assert!(!device.journal_dir().exists());
    coordinator
        .apply("com.example.other", &[device.dylib("Tweak.dylib")], Options::default())
        .unwrap();

    // A second start finds nothing left to do.
    let again = device.coordinator(Settings::default());
    assert!(again.recovered_on_start().is_empty());
}

#[test]
fn test_unreadable_journal_blocks_only_its_app() {
    let device = Device::new(&MachOBuilder::arm64().build());
    write_app(
        &device.temp.path().join("Bundle"),
        "BBBB",
        "com.example.other",
        "Other",
        &MachOBuilder::arm64().build(),
    );
    let broken = device.state().transactions().join("com.example.other");
    fs::create_dir_all(&broken).unwrap();
    fs::write(broken.join("journal.json"), b"{ not json").unwrap();

    let coordinator = device.coordinator(Settings::default());
    let failures = coordinator.recovery_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "com.example.other");
    assert!(matches!(failures[0].1, GraftError::RollbackFailed { .. }));

    coordinator
        .apply(APP, &[device.dylib("Tweak.dylib")], Options::default())
        .unwrap();
    let err = coordinator
        .apply("com.example.other", &[device.dylib("Other.dylib")], Options::default())
        .unwrap_err();
    assert!(matches!(err, GraftError::RollbackFailed { .. }));
    assert!(broken.exists());
}

#[test]
fn test_remove_all_and_unknown_names() {
    let device = Device::new(&MachOBuilder::arm64().build());
    let original = fs::read(device.executable()).unwrap();
    let coordinator = device.coordinator(Settings::default());
    coordinator
        .apply(
            APP,
            &[device.dylib("A.dylib"), device.dylib("B.dylib")],
            Options::default(),
        )
        .unwrap();

    let err = coordinator
        .remove(APP, &["Nope.dylib".to_string()], Options::default())
        .unwrap_err();
    assert!(matches!(err, GraftError::NotAttached { .. }));

    let outcome = coordinator.remove_all(APP, Options::default()).unwrap();
    assert_eq!(outcome.detached.len(), 2);
    assert_eq!(fs::read(device.executable()).unwrap(), original);

    let outcome = coordinator.remove_all(APP, Options::default()).unwrap();
    assert!(outcome.detached.is_empty());
}

#[test]
fn test_resource_bundle_leaves_load_commands_alone() {
    let device = Device::new(&MachOBuilder::arm64().build());
    let original = fs::read(device.executable()).unwrap();
    let bundle = device.temp.path().join("modules/Prefs.bundle");
    fs::create_dir_all(&bundle).unwrap();
    fs::write(bundle.join("Root.plist"), "x").unwrap();
    let coordinator = device.coordinator(Settings::default());

    coordinator.apply(APP, &[bundle], Options::default()).unwrap();
    assert_eq!(fs::read(device.executable()).unwrap(), original);
    assert!(device.app.join("Prefs.bundle/.graft").is_file());
    assert!(!device.app.join("GraftModules").exists());
    assert!(coordinator.verify(APP).unwrap().is_consistent());
}

#[test]
fn test_weak_references_from_settings() {
    let device = Device::new(&MachOBuilder::arm64().build());
    let settings = Settings {
        weak_references: true,
        ..Settings::default()
    };
    let coordinator = device.coordinator(settings);
    coordinator
        .apply(APP, &[device.dylib("Tweak.dylib")], Options::default())
        .unwrap();

    let summary = patcher::summarize(&fs::read(device.executable()).unwrap()).unwrap();
    let tweak = summary[0]
        .references
        .iter()
        .find(|r| r.path.ends_with("Tweak.dylib"))
        .unwrap();
    assert!(tweak.weak);
}

#[test]
fn test_reload_terminates_running_instance() {
    let device = Device::new(&MachOBuilder::arm64().build());
    let processes = FakeProcesses {
        running: vec![ProcessHandle {
            pid: 42,
            name: "Demo".to_string(),
            executable: Some(device.executable()),
        }],
        ..Default::default()
    };
    let log = Arc::clone(&processes.terminated);
    let coordinator = device
        .coordinator(Settings::default())
        .with_processes(Box::new(processes));

    let outcome = coordinator
        .apply(
            APP,
            &[device.dylib("Tweak.dylib")],
            Options {
                reload: false,
                ..Options::default()
            },
        )
        .unwrap();
    assert!(outcome.reload.is_none());
    assert!(log.lock().unwrap().is_empty());

    let outcome = coordinator
        .remove_all(APP, Options::default())
        .unwrap();
    assert_eq!(outcome.reload.unwrap().terminated.len(), 1);
    assert_eq!(*log.lock().unwrap(), vec![(42, true)]);
}

#[test]
fn test_concurrent_applies_to_one_app_serialize() {
    let device = Device::new(&MachOBuilder::arm64().build());
    let coordinator = Arc::new(device.coordinator(Settings::default()));
    let sources: Vec<PathBuf> = (0..4)
        .map(|i| device.dylib(&format!("T{i}.dylib")))
        .collect();

    let handles: Vec<_> = sources
        .into_iter()
        .map(|source| {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || coordinator.apply(APP, &[source], Options::default()))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    assert_eq!(device.manifest().attachments.len(), 4);
    let inspection = coordinator.verify(APP).unwrap();
    assert!(inspection.is_consistent());
    assert_eq!(inspection.references.len(), 4);
}

#[test]
fn test_apply_persists_sources_and_eject_drops_them() {
    let device = Device::new(&MachOBuilder::arm64().build());
    let coordinator = device.coordinator(Settings::default());
    let tweak = device.dylib("Tweak.dylib");
    let kept = device.state().persistent().join(APP).join("Tweak.dylib");

    coordinator.apply(APP, &[tweak.clone()], Options::default()).unwrap();
    assert_eq!(fs::read(&kept).unwrap(), fs::read(&tweak).unwrap());
    assert_eq!(coordinator.persisted_assets(APP).unwrap(), vec![kept.clone()]);

    let keep = Options {
        keep_persisted: true,
        ..Options::default()
    };
    coordinator.remove_all(APP, keep).unwrap();
    assert!(kept.is_file());

    coordinator.apply(APP, &[tweak], Options::default()).unwrap();
    coordinator
        .remove(APP, &["Tweak.dylib".to_string()], Options::default())
        .unwrap();
    assert!(!kept.exists());
    assert!(coordinator.persisted_assets(APP).unwrap().is_empty());
}

#[test]
fn test_disable_and_enable_round_trip() {
    let device = Device::new(&MachOBuilder::arm64().build());
    let before = references(&device.executable());
    let coordinator = device.coordinator(Settings::default());
    coordinator
        .apply(APP, &[device.dylib("Tweak.dylib")], Options::default())
        .unwrap();
    let linked = references(&device.executable());
    let staged = device.app.join("GraftModules/Tweak.dylib");
    let parked = device.state().disabled().join(APP).join("Tweak.dylib");

    let outcome = coordinator
        .disable(APP, &["Tweak.dylib".to_string()], Options::default())
        .unwrap();
    assert_eq!(outcome.disabled.len(), 1);
    assert_eq!(references(&device.executable()), before);
    assert!(!staged.exists());
    assert!(parked.is_file());
    assert!(!device.manifest().attachments[0].enabled);
    assert!(coordinator.verify(APP).unwrap().is_consistent());

    // Disabling again changes nothing.
    let again = coordinator
        .disable(APP, &["Tweak.dylib".to_string()], Options::default())
        .unwrap();
    assert!(again.disabled.is_empty());

    let outcome = coordinator
        .enable(APP, &["Tweak.dylib".to_string()], Options::default())
        .unwrap();
    assert_eq!(outcome.enabled.len(), 1);
    assert_eq!(references(&device.executable()), linked);
    assert!(staged.is_file());
    assert!(!parked.exists());
    assert!(device.manifest().attachments[0].enabled);
    assert!(coordinator.verify(APP).unwrap().is_consistent());
}

#[test]
fn test_disable_unknown_module_is_not_attached() {
    let device = Device::new(&MachOBuilder::arm64().build());
    let coordinator = device.coordinator(Settings::default());
    let err = coordinator
        .disable(APP, &["Nope.dylib".to_string()], Options::default())
        .unwrap_err();
    assert!(matches!(err, GraftError::NotAttached { .. }));
}

#[test]
fn test_failed_disable_rolls_back() {
    let device = Device::new(&MachOBuilder::arm64().build());
    device
        .coordinator(Settings::default())
        .apply(APP, &[device.dylib("Tweak.dylib")], Options::default())
        .unwrap();
    let patched = fs::read(device.executable()).unwrap();
    let coordinator = device
        .coordinator(Settings::default())
        .with_signer(Box::new(Failing));

    let err = coordinator
        .disable(APP, &["Tweak.dylib".to_string()], Options::default())
        .unwrap_err();
    assert!(matches!(cause(err), GraftError::SigningFailed { .. }));
    assert_eq!(fs::read(device.executable()).unwrap(), patched);
    assert!(device.app.join("GraftModules/Tweak.dylib").is_file());
    assert!(!device.state().disabled().join(APP).join("Tweak.dylib").exists());
    assert!(device.manifest().attachments[0].enabled);
}

#[test]
fn test_enable_uses_persisted_copy_when_disabled_copy_is_gone() {
    let device = Device::new(&MachOBuilder::arm64().build());
    let coordinator = device.coordinator(Settings::default());
    coordinator
        .apply(APP, &[device.dylib("Tweak.dylib")], Options::default())
        .unwrap();
    coordinator
        .disable(APP, &["Tweak.dylib".to_string()], Options::default())
        .unwrap();
    fs::remove_dir_all(device.state().disabled().join(APP)).unwrap();

    coordinator
        .enable(APP, &["Tweak.dylib".to_string()], Options::default())
        .unwrap();
    assert!(device.app.join("GraftModules/Tweak.dylib").is_file());
    assert!(coordinator.verify(APP).unwrap().is_consistent());
}

#[test]
fn test_eject_disabled_module() {
    let device = Device::new(&MachOBuilder::arm64().build());
    let original = fs::read(device.executable()).unwrap();
    let coordinator = device.coordinator(Settings::default());
    coordinator
        .apply(APP, &[device.dylib("Tweak.dylib")], Options::default())
        .unwrap();
    coordinator
        .disable(APP, &["Tweak.dylib".to_string()], Options::default())
        .unwrap();

    let outcome = coordinator
        .remove(APP, &["Tweak.dylib".to_string()], Options::default())
        .unwrap();
    assert_eq!(outcome.detached.len(), 1);
    assert_eq!(fs::read(device.executable()).unwrap(), original);
    assert!(device.manifest().attachments.is_empty());
    assert!(!device.state().disabled().join(APP).exists());
    assert!(!device.state().persistent().join(APP).exists());
}

#[test]
fn test_apply_persisted_after_app_update() {
    let device = Device::new(&MachOBuilder::arm64().build());
    let original = fs::read(device.executable()).unwrap();
    let coordinator = device.coordinator(Settings::default());
    let tweak = device.dylib("Tweak.dylib");
    let prefs = device.temp.path().join("modules/Prefs.bundle");
    fs::create_dir_all(&prefs).unwrap();
    fs::write(prefs.join("Root.plist"), "x").unwrap();
    coordinator
        .apply(APP, &[tweak.clone(), prefs.clone()], Options::default())
        .unwrap();
    let linked = references(&device.executable());

    // An update replaces the bundle contents and the sources are long gone.
    fs::remove_file(&tweak).unwrap();
    fs::remove_dir_all(&prefs).unwrap();
    fs::write(device.executable(), &original).unwrap();
    fs::remove_dir_all(device.app.join("GraftModules")).unwrap();
    fs::remove_dir_all(device.app.join("Prefs.bundle")).unwrap();
    assert!(coordinator.apply(APP, &[device.dylib("Other.dylib")], Options::default()).is_err());

    let outcome = coordinator.apply_persisted(APP, Options::default()).unwrap();
    assert_eq!(outcome.attached.len(), 2);
    assert!(outcome.detached.is_empty());
    assert_eq!(references(&device.executable()), linked);
    assert!(device.app.join("GraftModules/Tweak.dylib").is_file());
    assert!(device.app.join("Prefs.bundle/Root.plist").is_file());
    assert!(coordinator.verify(APP).unwrap().is_consistent());

    // Nothing left to restore.
    let outcome = coordinator.apply_persisted(APP, Options::default()).unwrap();
    assert!(outcome.attached.is_empty());
}

#[test]
fn test_apply_persisted_refuses_unrecorded_load_commands() {
    let device = Device::new(
        &MachOBuilder::arm64()
            .dylib("@executable_path/GraftModules/Stray.dylib")
            .build(),
    );
    let coordinator = device.coordinator(Settings::default());
    let err = coordinator
        .apply_persisted(APP, Options::default())
        .unwrap_err();
    assert!(matches!(err, GraftError::IntegrityMismatch { .. }));
}
