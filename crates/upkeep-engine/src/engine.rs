use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use upkeep_core::{AttemptError, AttemptOutcome, AttemptState, UpgradeErrorKind, UpgradePackage};
use upkeep_security::sha256_file_hex;

use crate::attempt::{next_attempt_id, UpgradeAttempt};
use crate::audit::{last_installed, AttemptRecorder, AuditRecord, ATTEMPT_FINISHED};
use crate::backup::{BackupManager, BackupRecord};
use crate::capabilities::{call_bounded, Capabilities};
use crate::fs_utils::remove_file_if_exists;
use crate::gates::signature_sidecar_path;
use crate::health::HealthChecker;
use crate::installer::{InstallPreview, Installer};
use crate::layout::StateLayout;
use crate::locator::PackageLocator;
use crate::lock::{LockCoordinator, DEFAULT_LOCK_ID};
use crate::rollback::RollbackController;
use crate::validator::{read_manifest_entry, IntegrityValidator};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound for each kind of external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub approval: Duration,
    pub signature: Duration,
    pub manifest: Duration,
    pub lock: Duration,
    pub health: Duration,
    pub hook: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            approval: DEFAULT_TIMEOUT,
            signature: DEFAULT_TIMEOUT,
            manifest: DEFAULT_TIMEOUT,
            lock: DEFAULT_TIMEOUT,
            health: DEFAULT_TIMEOUT,
            hook: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub watch_dir: PathBuf,
    pub extension: String,
    pub install_dir: PathBuf,
    pub state_dir: PathBuf,
    pub ignore_patterns: Vec<String>,
    pub lock_id: String,
    pub timeouts: Timeouts,
}

impl EngineConfig {
    pub fn new(
        watch_dir: impl Into<PathBuf>,
        install_dir: impl Into<PathBuf>,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            watch_dir: watch_dir.into(),
            extension: "zip".to_string(),
            install_dir: install_dir.into(),
            state_dir: state_dir.into(),
            ignore_patterns: Vec::new(),
            lock_id: DEFAULT_LOCK_ID.to_string(),
            timeouts: Timeouts::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.extension.trim_start_matches('.').is_empty() {
            return Err(anyhow!("artifact extension must not be empty"));
        }
        if self.lock_id.trim().is_empty() {
            return Err(anyhow!("lock identifier must not be empty"));
        }
        let install = normalize(&self.install_dir);
        let state = normalize(&self.state_dir);
        if state.starts_with(&install) || install.starts_with(&state) {
            return Err(anyhow!(
                "state directory {} and installation directory {} must not contain each other",
                self.state_dir.display(),
                self.install_dir.display()
            ));
        }
        Ok(())
    }
}

fn normalize(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Result of [`UpgradeEngine::preview`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradePreview {
    pub package: UpgradePackage,
    pub changes: InstallPreview,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub install_dir: PathBuf,
    pub install_dir_present: bool,
    pub backup: Option<BackupRecord>,
    pub pending: Option<UpgradePackage>,
    pub last_installed: Option<PathBuf>,
}

/// Drives upgrade attempts through the lifecycle:
/// locate, approve, validate, lock, back up, install, health check, and on
/// failure after the install started, roll back.
pub struct UpgradeEngine {
    config: EngineConfig,
    layout: StateLayout,
    capabilities: Capabilities,
    recorder: Arc<dyn AttemptRecorder>,
}

impl UpgradeEngine {
    pub fn new(
        config: EngineConfig,
        capabilities: Capabilities,
        recorder: Arc<dyn AttemptRecorder>,
    ) -> Result<Self> {
        config.validate()?;
        let layout = StateLayout::new(&config.state_dir);
        layout.ensure_base_dirs()?;
        Ok(Self {
            config,
            layout,
            capabilities,
            recorder,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn locator(&self) -> PackageLocator {
        PackageLocator::new(&self.config.watch_dir, &self.config.extension)
    }

    fn backup_manager(&self) -> BackupManager<'_> {
        BackupManager::new(&self.layout, &self.config.install_dir)
    }

    fn lock_coordinator(&self) -> LockCoordinator {
        LockCoordinator::new(
            Arc::clone(&self.capabilities.locker),
            self.config.lock_id.clone(),
            self.config.timeouts.lock,
        )
    }

    /// Runs one attempt against `artifact`, or against the newest artifact in
    /// the watch directory. Stage failures are reported in the returned
    /// attempt; `Err` is reserved for internal faults.
    pub fn run(&self, artifact: Option<&Path>) -> Result<UpgradeAttempt> {
        let started = Instant::now();
        let mut attempt = UpgradeAttempt::begin(next_attempt_id()?)?;
        info!(attempt_id = %attempt.id, "starting upgrade attempt");

        self.drive(&mut attempt, artifact)?;
        self.finish(&attempt, started.elapsed());
        Ok(attempt)
    }

    fn drive(&self, attempt: &mut UpgradeAttempt, artifact: Option<&Path>) -> Result<()> {
        let package = match self.locate(artifact) {
            Ok(package) => package,
            Err(err) => return self.abort(attempt, err),
        };
        info!(attempt_id = %attempt.id, artifact = %package.path.display(), "located upgrade artifact");
        attempt.package = Some(package.clone());
        attempt.advance(AttemptState::Located)?;

        if let Err(err) = self.approve(&package.path) {
            return self.abort(attempt, err);
        }

        let validator = IntegrityValidator::new(
            Arc::clone(&self.capabilities.signature),
            Arc::clone(&self.capabilities.manifest),
            self.config.timeouts.signature,
            self.config.timeouts.manifest,
        );
        let package = match validator.validate(package) {
            Ok(package) => package,
            Err(err) => return self.abort(attempt, err),
        };
        attempt.artifact_sha256 = match sha256_file_hex(&package.path) {
            Ok(digest) => Some(digest),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to digest artifact for audit");
                None
            }
        };
        attempt.package = Some(package.clone());
        attempt.advance(AttemptState::Validated)?;

        let _guard = match self.lock_coordinator().acquire() {
            Ok(guard) => guard,
            Err(err) => return self.abort(attempt, err),
        };
        attempt.advance(AttemptState::Locked)?;

        self.run_hook("before_upgrade", &package.path, None);

        let backups = self.backup_manager();
        if let Err(err) = self.take_backup(&backups, &attempt.id) {
            return self.fail(attempt, err, &backups);
        }
        attempt.advance(AttemptState::BackedUp)?;

        attempt.advance(AttemptState::Installing)?;
        let installer = Installer::new(&self.config.install_dir, &self.config.ignore_patterns);
        let report = match installer.install(&package, &attempt.id) {
            Ok(report) => report,
            Err(err) => {
                self.run_hook("after_upgrade", &package.path, Some(false));
                let err = AttemptError::from_anyhow(UpgradeErrorKind::InstallFailed, &err);
                return self.fail(attempt, err, &backups);
            }
        };
        self.recorder
            .metric("upkeep_install_files", report.installed_files.len() as f64);
        self.emit(
            "upgrade_installed",
            json!({
                "attempt_id": attempt.id,
                "artifact": package.path,
                "files": report.installed_files,
                "ignored": report.ignored_files,
            }),
            false,
        );
        attempt.record_install(report);
        attempt.advance(AttemptState::Installed)?;
        self.run_hook("after_upgrade", &package.path, Some(true));

        attempt.advance(AttemptState::HealthChecking)?;
        let checker = HealthChecker::new(
            Arc::clone(&self.capabilities.health),
            self.config.timeouts.health,
        );
        if let Err(err) = checker.check() {
            return self.fail(attempt, err, &backups);
        }

        attempt.advance(AttemptState::Succeeded)
    }

    fn locate(&self, artifact: Option<&Path>) -> Result<UpgradePackage, AttemptError> {
        let locator = self.locator();
        match artifact {
            Some(path) => locator
                .package_at(path)
                .map_err(|err| AttemptError::from_anyhow(UpgradeErrorKind::NoPackageFound, &err)),
            None => match locator.locate() {
                Ok(Some(package)) => Ok(package),
                Ok(None) => Err(AttemptError::new(
                    UpgradeErrorKind::NoPackageFound,
                    format!(
                        "no *.{} artifact in {}",
                        self.config.extension.trim_start_matches('.'),
                        self.config.watch_dir.display()
                    ),
                )),
                Err(err) => Err(AttemptError::from_anyhow(
                    UpgradeErrorKind::NoPackageFound,
                    &err,
                )),
            },
        }
    }

    fn approve(&self, artifact: &Path) -> Result<(), AttemptError> {
        let approver = Arc::clone(&self.capabilities.approver);
        let owned = artifact.to_path_buf();
        match call_bounded("approval", self.config.timeouts.approval, move |ctx| {
            approver.approve(&owned, ctx)
        }) {
            Ok(true) => Ok(()),
            Ok(false) => Err(AttemptError::new(
                UpgradeErrorKind::ApprovalDenied,
                format!("upgrade of {} was not approved", artifact.display()),
            )),
            Err(err) => Err(AttemptError::from_anyhow(
                UpgradeErrorKind::ApprovalDenied,
                &err,
            )),
        }
    }

    fn take_backup(
        &self,
        backups: &BackupManager<'_>,
        attempt_id: &str,
    ) -> Result<BackupRecord, AttemptError> {
        let record = backups
            .backup(attempt_id)
            .and_then(|_| {
                backups.verify()?.ok_or_else(|| {
                    anyhow!("backup slot is missing right after it was written")
                })
            })
            .map_err(|err| AttemptError::from_anyhow(UpgradeErrorKind::BackupFailed, &err))?;
        self.emit(
            "backup",
            json!({
                "attempt_id": attempt_id,
                "backup_dir": backups.tree_dir(),
                "files": record.file_count,
            }),
            false,
        );
        Ok(record)
    }

    /// Routes a failure after the lock was taken: kinds that may have touched
    /// the installation roll back, the rest abort.
    fn fail(
        &self,
        attempt: &mut UpgradeAttempt,
        err: AttemptError,
        backups: &BackupManager<'_>,
    ) -> Result<()> {
        if err.kind.triggers_rollback() {
            self.recover(attempt, err, backups)
        } else {
            self.abort(attempt, err)
        }
    }

    fn abort(&self, attempt: &mut UpgradeAttempt, err: AttemptError) -> Result<()> {
        warn!(
            attempt_id = %attempt.id,
            kind = err.kind.as_str(),
            reason = %err.message,
            "upgrade attempt aborted"
        );
        let data = json!({
            "attempt_id": attempt.id,
            "artifact": attempt.package.as_ref().map(|package| &package.path),
            "error": err.message,
        });
        self.emit(err.kind.audit_action(), data, true);
        attempt.error = Some(err);
        attempt.advance(AttemptState::Aborted)
    }

    fn recover(
        &self,
        attempt: &mut UpgradeAttempt,
        err: AttemptError,
        backups: &BackupManager<'_>,
    ) -> Result<()> {
        warn!(
            attempt_id = %attempt.id,
            kind = err.kind.as_str(),
            reason = %err.message,
            "upgrade failed after install started; rolling back"
        );
        self.emit(
            err.kind.audit_action(),
            json!({
                "attempt_id": attempt.id,
                "artifact": attempt.package.as_ref().map(|package| &package.path),
                "error": err.message,
            }),
            true,
        );
        attempt.advance(AttemptState::RollingBack)?;

        let controller = RollbackController::new(backups, &self.config.install_dir);
        match controller.restore() {
            Ok(record) => {
                self.emit(
                    "rollback",
                    json!({
                        "attempt_id": attempt.id,
                        "restored_from": backups.tree_dir(),
                        "backup_attempt": record.attempt_id,
                        "manual": false,
                    }),
                    false,
                );
                attempt.error = Some(err);
                attempt.advance(AttemptState::RolledBack)
            }
            Err(rollback_err) => {
                let degraded = AttemptError::new(
                    UpgradeErrorKind::RollbackFailed,
                    format!("{}; rollback failed: {rollback_err:#}", err.message),
                );
                self.emit(
                    UpgradeErrorKind::RollbackFailed.audit_action(),
                    json!({
                        "attempt_id": attempt.id,
                        "cause": err.kind.as_str(),
                        "error": degraded.message,
                    }),
                    true,
                );
                attempt.error = Some(degraded);
                attempt.advance(AttemptState::RollbackFailed)
            }
        }
    }

    fn finish(&self, attempt: &UpgradeAttempt, elapsed: Duration) {
        let record = attempt.to_record();
        match serde_json::to_value(&record) {
            Ok(data) => self.emit(ATTEMPT_FINISHED, data, false),
            Err(err) => warn!(error = %err, "failed to serialize attempt record"),
        }

        let outcome = attempt.outcome().unwrap_or(AttemptOutcome::Failed);
        self.recorder
            .metric(&format!("upkeep_attempt_{}", outcome.as_str()), 1.0);
        self.recorder
            .metric("upkeep_attempt_seconds", elapsed.as_secs_f64());
        self.recorder.explain(&explain_attempt(attempt));

        match outcome {
            AttemptOutcome::Succeeded => info!(attempt_id = %attempt.id, "upgrade succeeded"),
            AttemptOutcome::Failed => info!(
                attempt_id = %attempt.id,
                state = attempt.state.as_str(),
                "upgrade did not land; installation unchanged"
            ),
            AttemptOutcome::Degraded => error!(
                attempt_id = %attempt.id,
                "upgrade left the installation DEGRADED; operator intervention required"
            ),
        }
    }

    fn run_hook(&self, label: &'static str, artifact: &Path, installed: Option<bool>) {
        let hooks = Arc::clone(&self.capabilities.hooks);
        let owned = artifact.to_path_buf();
        let result = call_bounded(label, self.config.timeouts.hook, move |_| match installed {
            None => hooks.before_upgrade(&owned),
            Some(installed) => hooks.after_upgrade(&owned, installed),
        });
        if let Err(err) = result {
            warn!(hook = label, error = %format!("{err:#}"), "upgrade hook failed");
        }
    }

    /// Audits, and alerts when asked. Sink failures never change the attempt.
    pub(crate) fn emit(&self, action: &str, data: Value, alert: bool) {
        let record = AuditRecord::now(action, data);
        if let Err(err) = self.recorder.audit(&record) {
            warn!(action, error = %format!("{err:#}"), "failed to write audit record");
        }
        if alert {
            self.recorder.alert(action, &record.data);
        }
    }

    pub fn status(&self) -> Result<EngineStatus> {
        let history = self.recorder.history(usize::MAX)?;
        Ok(EngineStatus {
            install_dir: self.config.install_dir.clone(),
            install_dir_present: self.config.install_dir.is_dir(),
            backup: self.backup_manager().verify()?,
            pending: self.locator().locate()?,
            last_installed: last_installed(&history),
        })
    }

    pub fn history(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        self.recorder.history(limit)
    }

    /// Reports what installing `artifact` (or the newest waiting artifact)
    /// would change. Takes no lock and writes nothing.
    pub fn preview(&self, artifact: Option<&Path>) -> Result<UpgradePreview> {
        let package = self.locate(artifact)?;
        let manifest = read_manifest_entry(&package.path)?;
        let package = package.with_manifest(manifest);
        let installer = Installer::new(&self.config.install_dir, &self.config.ignore_patterns);
        let changes = installer.preview(&package)?;
        info!(
            artifact = %package.path.display(),
            added = changes.added.len(),
            changed = changes.changed.len(),
            "previewed upgrade"
        );
        Ok(UpgradePreview { package, changes })
    }

    /// Moves a consumed artifact and its signature sidecar into `dir`.
    pub fn move_processed(&self, artifact: &Path, dir: &Path) -> Result<PathBuf> {
        let result = move_into(artifact, dir).and_then(|moved| {
            let sidecar = signature_sidecar_path(artifact);
            if sidecar.is_file() {
                move_into(&sidecar, dir)?;
            }
            Ok(moved)
        });
        match &result {
            Ok(moved) => {
                info!(artifact = %artifact.display(), moved_to = %moved.display(), "moved processed artifact");
                self.emit(
                    "artifact_moved",
                    json!({ "artifact": artifact, "moved_to": moved }),
                    false,
                );
            }
            Err(err) => {
                warn!(artifact = %artifact.display(), error = %format!("{err:#}"), "failed to move processed artifact");
                self.emit(
                    "cleanup_error",
                    json!({ "artifact": artifact, "error": format!("{err:#}") }),
                    false,
                );
            }
        }
        result
    }

    /// Deletes a consumed artifact and its signature sidecar.
    pub fn cleanup(&self, artifact: &Path) -> Result<()> {
        let sidecar = signature_sidecar_path(artifact);
        let result = remove_file_if_exists(artifact)
            .and_then(|()| remove_file_if_exists(&sidecar))
            .with_context(|| format!("failed to clean up {}", artifact.display()));
        match &result {
            Ok(()) => {
                info!(artifact = %artifact.display(), "cleaned up artifact");
                self.emit("cleanup", json!({ "artifact": artifact }), false);
            }
            Err(err) => {
                warn!(artifact = %artifact.display(), error = %format!("{err:#}"), "cleanup failed");
                self.emit(
                    "cleanup_error",
                    json!({ "artifact": artifact, "error": format!("{err:#}") }),
                    false,
                );
            }
        }
        result
    }

    /// Operator-triggered restore from the backup slot, under the upgrade lock.
    pub fn rollback_now(&self) -> Result<BackupRecord, AttemptError> {
        let guard = match self.lock_coordinator().acquire() {
            Ok(guard) => guard,
            Err(err) => {
                self.emit(
                    err.kind.audit_action(),
                    json!({ "manual": true, "error": err.message }),
                    true,
                );
                return Err(err);
            }
        };

        let backups = self.backup_manager();
        let controller = RollbackController::new(&backups, &self.config.install_dir);
        let result = controller.restore();
        drop(guard);

        match result {
            Ok(record) => {
                self.emit(
                    "rollback",
                    json!({
                        "restored_from": backups.tree_dir(),
                        "backup_attempt": record.attempt_id,
                        "manual": true,
                    }),
                    false,
                );
                Ok(record)
            }
            Err(err) => {
                let err = AttemptError::from_anyhow(UpgradeErrorKind::RollbackFailed, &err);
                self.emit(
                    err.kind.audit_action(),
                    json!({ "manual": true, "error": err.message }),
                    true,
                );
                Err(err)
            }
        }
    }
}

fn move_into(file: &Path, dir: &Path) -> Result<PathBuf> {
    let name = file
        .file_name()
        .ok_or_else(|| anyhow!("{} has no file name", file.display()))?;
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let dst = dir.join(name);
    if fs::rename(file, &dst).is_err() {
        fs::copy(file, &dst).with_context(|| {
            format!("failed to copy {} to {}", file.display(), dst.display())
        })?;
        fs::remove_file(file).with_context(|| format!("failed to remove {}", file.display()))?;
    }
    Ok(dst)
}

fn explain_attempt(attempt: &UpgradeAttempt) -> String {
    let artifact = attempt
        .package
        .as_ref()
        .map(|package| package.file_name.as_str())
        .unwrap_or("no artifact");
    match (&attempt.error, attempt.state) {
        (None, AttemptState::Succeeded) => format!(
            "attempt {} installed {artifact}: {} file(s) written, {} ignored",
            attempt.id,
            attempt.installed_files.len(),
            attempt.ignored_files.len()
        ),
        (Some(err), AttemptState::RolledBack) => format!(
            "attempt {} rolled back {artifact} after {}: {}",
            attempt.id,
            err.kind.as_str(),
            err.message
        ),
        (Some(err), AttemptState::RollbackFailed) => format!(
            "attempt {} could not restore the installation after installing {artifact}: {}",
            attempt.id, err.message
        ),
        (Some(err), _) => format!(
            "attempt {} stopped before touching the installation ({}): {}",
            attempt.id,
            err.kind.as_str(),
            err.message
        ),
        (None, state) => format!("attempt {} ended in state {}", attempt.id, state.as_str()),
    }
}
