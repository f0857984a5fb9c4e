use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tracing::{error, info};

use crate::backup::{BackupManager, BackupRecord};
use crate::fs_utils::{copy_dir_recursive, remove_dir_if_exists};

/// Restores the installation directory from the backup slot.
pub struct RollbackController<'a> {
    backups: &'a BackupManager<'a>,
    install_dir: &'a Path,
}

impl<'a> RollbackController<'a> {
    pub fn new(backups: &'a BackupManager<'a>, install_dir: &'a Path) -> Self {
        Self {
            backups,
            install_dir,
        }
    }

    pub fn restore(&self) -> Result<BackupRecord> {
        let record = self.backups.verify()?.ok_or_else(|| {
            anyhow!(
                "no backup available to restore {}",
                self.install_dir.display()
            )
        })?;

        let result = remove_dir_if_exists(self.install_dir)
            .and_then(|()| copy_dir_recursive(&self.backups.tree_dir(), self.install_dir))
            .with_context(|| {
                format!(
                    "failed to restore {} from backup taken by attempt {}",
                    self.install_dir.display(),
                    record.attempt_id
                )
            });
        match result {
            Ok(files) => {
                info!(
                    install_dir = %self.install_dir.display(),
                    files,
                    backup_attempt = %record.attempt_id,
                    "rolled back installation"
                );
                Ok(record)
            }
            Err(err) => {
                error!(
                    install_dir = %self.install_dir.display(),
                    error = %format!("{err:#}"),
                    "ROLLBACK FAILED: installation state is unknown and needs an operator"
                );
                Err(err)
            }
        }
    }
}
