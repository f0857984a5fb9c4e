mod attempt;
mod audit;
mod backup;
mod capabilities;
mod engine;
mod fs_utils;
mod gates;
mod health;
mod installer;
mod layout;
mod locator;
mod lock;
mod rollback;
mod validator;
mod watch;

pub use attempt::{current_unix_timestamp, next_attempt_id, UpgradeAttempt};
pub use audit::{
    last_installed, AttemptRecord, AttemptRecorder, AuditRecord, JsonlAuditLog, NullRecorder,
    ATTEMPT_FINISHED,
};
pub use backup::{BackupManager, BackupRecord};
pub use capabilities::{
    call_bounded, call_bounded_with_late, AcceptManifest, Approver, AutoApprove, CallContext, CancelToken, Capabilities,
    HealthProbe, Locker, ManifestCheck, NoHealthProbe, NoHooks, NoLock, SignatureCheck,
    SkipSignature, UpgradeHooks,
};
pub use engine::{
    EngineConfig, EngineStatus, Timeouts, UpgradeEngine, UpgradePreview, DEFAULT_TIMEOUT,
};
pub use gates::{signature_sidecar_path, Ed25519Signature, VersionGate};
pub use health::{CommandProbe, HealthChecker};
pub use installer::{
    extract_archive, is_ignored, preview_archive, InstallPreview, InstallReport, Installer,
};
pub use layout::{staging_dir_for, StateLayout};
pub use locator::PackageLocator;
pub use lock::{FileLock, LockCoordinator, LockGuard, DEFAULT_LOCK_ID};
pub use rollback::RollbackController;
pub use validator::{read_manifest_entry, IntegrityValidator};
pub use watch::{
    ProcessedArtifacts, WatchOptions, WatchSummary, Watcher, DEFAULT_WATCH_INTERVAL,
};
