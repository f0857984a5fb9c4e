use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};
use upkeep_core::UpgradePackage;
use zip::read::ZipFile;
use zip::ZipArchive;

use crate::fs_utils::{copy_dir_recursive, move_dir_or_copy, remove_dir_if_exists};
use crate::layout::staging_dir_for;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub installed_files: Vec<String>,
    pub ignored_files: Vec<String>,
}

/// What an install of an archive would do to the live directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallPreview {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
    pub ignored: Vec<String>,
}

impl InstallPreview {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty()
    }
}

/// Applies an archive to the installation directory through a staging copy.
///
/// The live directory is only replaced once every entry extracted cleanly,
/// and then by directory rename.
pub struct Installer<'a> {
    install_dir: &'a Path,
    ignore_patterns: &'a [String],
}

impl<'a> Installer<'a> {
    pub fn new(install_dir: &'a Path, ignore_patterns: &'a [String]) -> Self {
        Self {
            install_dir,
            ignore_patterns,
        }
    }

    pub fn install(&self, package: &UpgradePackage, attempt_id: &str) -> Result<InstallReport> {
        let staging = staging_dir_for(self.install_dir, attempt_id)?;
        let result = self.install_staged(package, &staging);
        if let Err(err) = remove_dir_if_exists(&staging) {
            warn!(staging = %staging.display(), error = %format!("{err:#}"), "failed to remove staging dir");
        }
        result
    }

    /// Compares the archive against the live directory without writing.
    pub fn preview(&self, package: &UpgradePackage) -> Result<InstallPreview> {
        preview_archive(&package.path, self.install_dir, self.ignore_patterns)
    }

    fn install_staged(&self, package: &UpgradePackage, staging: &Path) -> Result<InstallReport> {
        remove_dir_if_exists(staging)?;
        let tree = staging.join("tree");
        if self.install_dir.is_dir() {
            copy_dir_recursive(self.install_dir, &tree)?;
        } else {
            fs::create_dir_all(&tree)
                .with_context(|| format!("failed to create {}", tree.display()))?;
        }

        let report = extract_archive(&package.path, &tree, self.ignore_patterns)?;
        swap_into_place(&tree, self.install_dir, &staging.join("retired"))?;
        info!(
            artifact = %package.path.display(),
            installed = report.installed_files.len(),
            ignored = report.ignored_files.len(),
            "installed upgrade"
        );
        Ok(report)
    }
}

pub fn is_ignored(entry_name: &str, ignore_patterns: &[String]) -> bool {
    ignore_patterns
        .iter()
        .any(|pattern| !pattern.is_empty() && entry_name.contains(pattern.as_str()))
}

/// Extracts every non-ignored entry of `archive_path` into `dst`, overwriting.
pub fn extract_archive(
    archive_path: &Path,
    dst: &Path,
    ignore_patterns: &[String],
) -> Result<InstallReport> {
    let file = File::open(archive_path)
        .with_context(|| format!("failed to open upgrade artifact {}", archive_path.display()))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("failed to read zip archive {}", archive_path.display()))?;

    let mut report = InstallReport::default();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).with_context(|| {
            format!(
                "failed to read entry #{index} of {}",
                archive_path.display()
            )
        })?;
        let name = entry.name().to_string();
        if is_ignored(&name, ignore_patterns) {
            debug!(entry = %name, "ignored archive entry");
            report.ignored_files.push(name);
            continue;
        }

        let relative = entry_relative_path(&entry)?;
        ensure_no_symlinks(dst, &relative)?;
        let target = dst.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("failed to create {}", target.display()))?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut out = File::create(&target)
            .with_context(|| format!("failed to write {}", target.display()))?;
        io::copy(&mut entry, &mut out)
            .with_context(|| format!("failed to extract {name} to {}", target.display()))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode().filter(|mode| mode & 0o777 != 0) {
            use std::os::unix::fs::PermissionsExt;

            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777))
                .with_context(|| format!("failed to set mode on {}", target.display()))?;
        }

        report.installed_files.push(name);
    }

    Ok(report)
}

/// Reports which entries of `archive_path` would add, change or leave alone
/// files under `install_dir`. Nothing is written.
pub fn preview_archive(
    archive_path: &Path,
    install_dir: &Path,
    ignore_patterns: &[String],
) -> Result<InstallPreview> {
    let file = File::open(archive_path)
        .with_context(|| format!("failed to open upgrade artifact {}", archive_path.display()))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("failed to read zip archive {}", archive_path.display()))?;

    let mut preview = InstallPreview::default();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).with_context(|| {
            format!(
                "failed to read entry #{index} of {}",
                archive_path.display()
            )
        })?;
        let name = entry.name().to_string();
        if is_ignored(&name, ignore_patterns) {
            preview.ignored.push(name);
            continue;
        }
        let relative = entry_relative_path(&entry)?;
        if entry.is_dir() {
            continue;
        }

        let target = install_dir.join(&relative);
        if target.is_file() {
            let mut incoming = Vec::new();
            entry
                .read_to_end(&mut incoming)
                .with_context(|| format!("failed to read {name} from the archive"))?;
            let existing = fs::read(&target)
                .with_context(|| format!("failed to read {}", target.display()))?;
            if existing == incoming {
                preview.unchanged.push(name);
            } else {
                preview.changed.push(name);
            }
        } else if fs::symlink_metadata(&target).is_ok() {
            preview.changed.push(name);
        } else {
            preview.added.push(name);
        }
    }
    Ok(preview)
}

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Validated destination of an entry, relative to the extraction root.
/// Symbolic link entries are refused.
fn entry_relative_path(entry: &ZipFile<'_>) -> Result<PathBuf> {
    let name = entry.name();
    if entry
        .unix_mode()
        .is_some_and(|mode| mode & S_IFMT == S_IFLNK)
    {
        return Err(anyhow!("archive entry is a symbolic link: {name}"));
    }
    entry
        .enclosed_name()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("archive entry escapes the installation root: {name}"))
}

/// Fails when any existing component of `relative` below `root` is a symbolic
/// link, so extraction never writes through a link to somewhere else.
fn ensure_no_symlinks(root: &Path, relative: &Path) -> Result<()> {
    let mut current = root.to_path_buf();
    for component in relative.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                return Err(anyhow!(
                    "archive entry {} would write through symbolic link {}",
                    relative.display(),
                    current.display()
                ));
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to stat {}", current.display()));
            }
        }
    }
    Ok(())
}

/// Retires the live directory, moves the staged tree into its place and drops
/// the retired copy. A failed move puts the retired directory back.
fn swap_into_place(staged: &Path, live: &Path, retired: &Path) -> Result<()> {
    let had_live = live.exists();
    if had_live {
        fs::rename(live, retired).with_context(|| {
            format!(
                "failed to retire {} to {}",
                live.display(),
                retired.display()
            )
        })?;
    }

    if let Err(err) = move_dir_or_copy(staged, live) {
        if had_live {
            let _ = remove_dir_if_exists(live);
            if let Err(restore_err) = fs::rename(retired, live) {
                return Err(err.context(format!(
                    "failed to restore {} after aborted swap: {restore_err}",
                    live.display()
                )));
            }
        }
        return Err(err);
    }

    if had_live {
        if let Err(err) = remove_dir_if_exists(retired) {
            warn!(retired = %retired.display(), error = %format!("{err:#}"), "failed to remove retired installation");
        }
    }
    Ok(())
}
