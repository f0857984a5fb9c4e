use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::attempt::current_unix_timestamp;
use crate::fs_utils::{copy_dir_recursive, remove_dir_if_exists, remove_file_if_exists};
use crate::layout::StateLayout;

/// Metadata stored next to the single backup slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub attempt_id: String,
    pub source: PathBuf,
    pub taken_at_unix: u64,
    pub file_count: u64,
}

/// Owns the one-slot backup of the installation directory.
pub struct BackupManager<'a> {
    layout: &'a StateLayout,
    install_dir: &'a Path,
}

impl<'a> BackupManager<'a> {
    pub fn new(layout: &'a StateLayout, install_dir: &'a Path) -> Self {
        Self {
            layout,
            install_dir,
        }
    }

    pub fn tree_dir(&self) -> PathBuf {
        self.layout.backup_tree_dir()
    }

    /// Replaces the slot with a fresh copy of the installation directory.
    pub fn backup(&self, attempt_id: &str) -> Result<BackupRecord> {
        if !self.install_dir.is_dir() {
            return Err(anyhow!(
                "installation directory does not exist: {}",
                self.install_dir.display()
            ));
        }

        let tree = self.layout.backup_tree_dir();
        let record_path = self.layout.backup_record_path();
        // The record goes first so a half-deleted slot never verifies.
        remove_file_if_exists(&record_path)
            .with_context(|| format!("failed to remove {}", record_path.display()))?;
        remove_dir_if_exists(&tree)?;

        let file_count = copy_dir_recursive(self.install_dir, &tree).with_context(|| {
            format!(
                "failed to back up {} into {}",
                self.install_dir.display(),
                tree.display()
            )
        })?;

        let record = BackupRecord {
            attempt_id: attempt_id.to_string(),
            source: self.install_dir.to_path_buf(),
            taken_at_unix: current_unix_timestamp()?,
            file_count,
        };
        let payload =
            serde_json::to_vec_pretty(&record).context("failed to serialize backup record")?;
        fs::write(&record_path, payload)
            .with_context(|| format!("failed to write {}", record_path.display()))?;

        info!(
            attempt_id,
            files = file_count,
            backup = %tree.display(),
            "backed up installation"
        );
        Ok(record)
    }

    /// Returns the record when the slot is complete: the record parses and the
    /// tree it describes is present.
    pub fn verify(&self) -> Result<Option<BackupRecord>> {
        let record_path = self.layout.backup_record_path();
        let raw = match fs::read(&record_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotADirectory => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", record_path.display()));
            }
        };
        let record: BackupRecord = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", record_path.display()))?;
        if !self.layout.backup_tree_dir().is_dir() {
            return Ok(None);
        }
        Ok(Some(record))
    }
}
