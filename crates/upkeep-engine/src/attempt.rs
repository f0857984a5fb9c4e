use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use upkeep_core::{AttemptError, AttemptOutcome, AttemptState, UpgradePackage};

use crate::audit::AttemptRecord;
use crate::installer::InstallReport;

static ATTEMPT_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}

/// `<unix seconds>-<pid>-<sequence>`; unique within a process and readable in
/// directory listings.
pub fn next_attempt_id() -> Result<String> {
    Ok(format!(
        "{}-{}-{}",
        current_unix_timestamp()?,
        std::process::id(),
        ATTEMPT_COUNTER.fetch_add(1, Ordering::Relaxed)
    ))
}

/// One end-to-end run of the upgrade lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeAttempt {
    pub id: String,
    pub package: Option<UpgradePackage>,
    pub artifact_sha256: Option<String>,
    pub state: AttemptState,
    pub transitions: Vec<AttemptState>,
    pub installed_files: Vec<String>,
    pub ignored_files: Vec<String>,
    pub started_at_unix: u64,
    pub finished_at_unix: Option<u64>,
    pub error: Option<AttemptError>,
}

impl UpgradeAttempt {
    pub fn begin(id: String) -> Result<Self> {
        Ok(Self {
            id,
            package: None,
            artifact_sha256: None,
            state: AttemptState::Idle,
            transitions: vec![AttemptState::Idle],
            installed_files: Vec::new(),
            ignored_files: Vec::new(),
            started_at_unix: current_unix_timestamp()?,
            finished_at_unix: None,
            error: None,
        })
    }

    pub fn advance(&mut self, next: AttemptState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(anyhow!(
                "illegal attempt transition {} -> {} (attempt {})",
                self.state.as_str(),
                next.as_str(),
                self.id
            ));
        }
        self.state = next;
        self.transitions.push(next);
        if next.is_terminal() {
            self.finished_at_unix = Some(current_unix_timestamp()?);
        }
        Ok(())
    }

    pub fn record_install(&mut self, report: InstallReport) {
        self.installed_files = report.installed_files;
        self.ignored_files = report.ignored_files;
    }

    pub fn outcome(&self) -> Option<AttemptOutcome> {
        self.state.outcome()
    }

    pub fn reached(&self, state: AttemptState) -> bool {
        self.transitions.contains(&state)
    }

    pub fn to_record(&self) -> AttemptRecord {
        let artifact = self.package.as_ref().map(|package| package.path.clone());
        AttemptRecord {
            attempt_id: self.id.clone(),
            installed_artifact: if self.state == AttemptState::Succeeded {
                artifact.clone()
            } else {
                None
            },
            artifact,
            artifact_sha256: self.artifact_sha256.clone(),
            manifest_version: self
                .package
                .as_ref()
                .and_then(UpgradePackage::manifest_version),
            state: self.state,
            outcome: self.outcome(),
            error_kind: self.error.as_ref().map(|error| error.kind),
            error_message: self.error.as_ref().map(|error| error.message.clone()),
            installed_files: self.installed_files.clone(),
            started_at_unix: self.started_at_unix,
            finished_at_unix: self.finished_at_unix,
        }
    }
}
