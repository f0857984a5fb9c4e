use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use upkeep_core::UpgradePackage;

use crate::attempt::current_unix_timestamp;

/// Finds the newest upgrade artifact in a watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageLocator {
    watch_dir: PathBuf,
    extension: String,
}

impl PackageLocator {
    pub fn new(watch_dir: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            watch_dir: watch_dir.into(),
            extension: extension.trim_start_matches('.').to_ascii_lowercase(),
        }
    }

    pub fn watch_dir(&self) -> &Path {
        &self.watch_dir
    }

    /// Picks the matching file with the greatest modification time. Equal
    /// modification times resolve to the greatest file name in byte order.
    pub fn locate(&self) -> Result<Option<UpgradePackage>> {
        let entries = match fs::read_dir(&self.watch_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read watch directory {}", self.watch_dir.display())
                });
            }
        };

        let mut newest: Option<(SystemTime, String, PathBuf)> = None;
        for entry in entries {
            let entry = entry.with_context(|| {
                format!("failed to read entry in {}", self.watch_dir.display())
            })?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !self.matches(&file_name) {
                continue;
            }
            let metadata = entry
                .metadata()
                .with_context(|| format!("failed to stat {}", entry.path().display()))?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata
                .modified()
                .with_context(|| format!("failed to read mtime of {}", entry.path().display()))?;

            let replace = match &newest {
                None => true,
                Some((best_modified, best_name, _)) => {
                    (modified, file_name.as_str()) > (*best_modified, best_name.as_str())
                }
            };
            if replace {
                newest = Some((modified, file_name, entry.path()));
            }
        }

        newest
            .map(|(modified, file_name, path)| build_package(path, file_name, modified))
            .transpose()
    }

    /// Describes an explicitly named artifact, as used by a manual trigger.
    pub fn package_at(&self, path: &Path) -> Result<UpgradePackage> {
        let metadata = fs::metadata(path)
            .with_context(|| format!("upgrade artifact not found: {}", path.display()))?;
        if !metadata.is_file() {
            return Err(anyhow!("upgrade artifact is not a file: {}", path.display()));
        }
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("upgrade artifact has no file name: {}", path.display()))?;
        let modified = metadata
            .modified()
            .with_context(|| format!("failed to read mtime of {}", path.display()))?;
        build_package(path.to_path_buf(), file_name, modified)
    }

    fn matches(&self, file_name: &str) -> bool {
        let lower = file_name.to_ascii_lowercase();
        lower
            .strip_suffix(&self.extension)
            .and_then(|stem| stem.strip_suffix('.'))
            .is_some_and(|stem| !stem.is_empty())
    }
}

fn build_package(path: PathBuf, file_name: String, modified: SystemTime) -> Result<UpgradePackage> {
    let modified_at_unix = modified
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    Ok(UpgradePackage {
        path,
        file_name,
        modified_at_unix,
        discovered_at_unix: current_unix_timestamp()?,
        manifest: None,
    })
}
