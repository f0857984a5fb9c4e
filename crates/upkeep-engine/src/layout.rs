use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Paths owned by the engine under its state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    state_dir: PathBuf,
}

impl StateLayout {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.state_dir.join("backup")
    }

    pub fn backup_tree_dir(&self) -> PathBuf {
        self.backup_dir().join("tree")
    }

    pub fn backup_record_path(&self) -> PathBuf {
        self.backup_dir().join("backup.json")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.state_dir.join("audit.jsonl")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [self.state_dir.clone(), self.locks_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Staging area for one attempt. It sits next to the installation directory so
/// the final swap is a same-filesystem rename.
pub fn staging_dir_for(install_dir: &Path, attempt_id: &str) -> Result<PathBuf> {
    let parent = install_dir
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = install_dir
        .file_name()
        .with_context(|| {
            format!(
                "installation directory has no final component: {}",
                install_dir.display()
            )
        })?
        .to_string_lossy();
    Ok(parent.join(format!(".{name}.upkeep-staging-{attempt_id}")))
}
