use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use upkeep_core::{AttemptOutcome, AttemptState, UpgradeErrorKind};

pub const ATTEMPT_FINISHED: &str = "attempt_finished";
const MANUAL_ROLLBACK_ACTION: &str = "rollback";

/// One line of the append-only audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: String,
    pub timestamp_unix: i64,
    pub action: String,
    pub data: Value,
}

impl AuditRecord {
    pub fn now(action: impl Into<String>, data: Value) -> Self {
        let now = Utc::now();
        Self {
            timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            timestamp_unix: now.timestamp(),
            action: action.into(),
            data,
        }
    }
}

/// Summary of a finished attempt, persisted as the data of an
/// `attempt_finished` audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_id: String,
    pub artifact: Option<PathBuf>,
    pub artifact_sha256: Option<String>,
    pub manifest_version: Option<String>,
    pub state: AttemptState,
    pub outcome: Option<AttemptOutcome>,
    pub error_kind: Option<UpgradeErrorKind>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub installed_files: Vec<String>,
    pub started_at_unix: u64,
    pub finished_at_unix: Option<u64>,
    /// Set only when this attempt left its artifact installed.
    pub installed_artifact: Option<PathBuf>,
}

/// Sink for everything an attempt wants the outside world to know.
pub trait AttemptRecorder: Send + Sync {
    fn audit(&self, record: &AuditRecord) -> Result<()>;
    fn alert(&self, event: &str, data: &Value);
    fn metric(&self, name: &str, value: f64);
    fn explain(&self, text: &str);

    /// Most recent `limit` audit records, oldest first. Sinks that cannot read
    /// back return nothing.
    fn history(&self, _limit: usize) -> Result<Vec<AuditRecord>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullRecorder;

impl AttemptRecorder for NullRecorder {
    fn audit(&self, _record: &AuditRecord) -> Result<()> {
        Ok(())
    }

    fn alert(&self, _event: &str, _data: &Value) {}

    fn metric(&self, _name: &str, _value: f64) {}

    fn explain(&self, _text: &str) {}
}

/// Appends audit records as JSON lines; alerts, metrics and explanations go to
/// the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonlAuditLog {
    path: PathBuf,
}

impl JsonlAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_all(&self) -> Result<Vec<AuditRecord>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read audit log {}", self.path.display()));
            }
        };

        let mut records = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) => warn!(
                    path = %self.path.display(),
                    line = index + 1,
                    error = %err,
                    "skipping malformed audit line"
                ),
            }
        }
        Ok(records)
    }
}

impl AttemptRecorder for JsonlAuditLog {
    fn audit(&self, record: &AuditRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(record).context("failed to serialize audit record")?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open audit log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append audit log {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("failed to flush audit log {}", self.path.display()))?;
        Ok(())
    }

    fn alert(&self, event: &str, data: &Value) {
        warn!(alert = event, data = %data, "upgrade alert");
    }

    fn metric(&self, name: &str, value: f64) {
        debug!(metric = name, value, "upgrade metric");
    }

    fn explain(&self, text: &str) {
        info!("{text}");
    }

    fn history(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let mut records = self.read_all()?;
        let skip = records.len().saturating_sub(limit);
        Ok(records.split_off(skip))
    }
}

/// Newest artifact that an attempt left installed, reconstructed from history.
/// A later manual rollback means the installed artifact is no longer known.
pub fn last_installed(records: &[AuditRecord]) -> Option<PathBuf> {
    for record in records.iter().rev() {
        if record.action == MANUAL_ROLLBACK_ACTION && record.data["manual"] == Value::Bool(true) {
            return None;
        }
        if record.action != ATTEMPT_FINISHED {
            continue;
        }
        let Ok(attempt) = serde_json::from_value::<AttemptRecord>(record.data.clone()) else {
            continue;
        };
        if attempt.installed_artifact.is_some() {
            return attempt.installed_artifact;
        }
    }
    None
}
