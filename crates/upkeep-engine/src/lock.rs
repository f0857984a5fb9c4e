use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};
use upkeep_core::{AttemptError, UpgradeErrorKind};

use crate::capabilities::{call_bounded_with_late, CallContext, Locker};
use crate::fs_utils::remove_file_if_exists;

pub const DEFAULT_LOCK_ID: &str = "upgrade";

/// Obtains the system-wide upgrade lock through the configured [`Locker`].
pub struct LockCoordinator {
    locker: Arc<dyn Locker>,
    lock_id: String,
    timeout: Duration,
}

impl LockCoordinator {
    pub fn new(locker: Arc<dyn Locker>, lock_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            locker,
            lock_id: lock_id.into(),
            timeout,
        }
    }

    pub fn acquire(&self) -> Result<LockGuard, AttemptError> {
        let locker = Arc::clone(&self.locker);
        let lock_id = self.lock_id.clone();
        let late_locker = Arc::clone(&self.locker);
        let late_lock_id = self.lock_id.clone();
        let acquired = call_bounded_with_late(
            "lock",
            self.timeout,
            move |ctx| locker.try_acquire(&lock_id, ctx),
            move |acquired| {
                if acquired {
                    release_late_lock(late_locker.as_ref(), &late_lock_id);
                }
            },
        );
        match acquired {
            Ok(true) => {
                debug!(lock_id = %self.lock_id, "acquired upgrade lock");
                Ok(LockGuard {
                    locker: Arc::clone(&self.locker),
                    lock_id: self.lock_id.clone(),
                })
            }
            Ok(false) => Err(AttemptError::new(
                UpgradeErrorKind::LockUnavailable,
                format!("lock '{}' is held elsewhere", self.lock_id),
            )),
            Err(err) => Err(AttemptError::from_anyhow(
                UpgradeErrorKind::LockUnavailable,
                &err.context(format!("failed to acquire lock '{}'", self.lock_id)),
            )),
        }
    }
}

fn release_late_lock(locker: &dyn Locker, lock_id: &str) {
    match locker.release(lock_id) {
        Ok(()) => warn!(lock_id, "released lock acquired after the deadline"),
        Err(err) => warn!(
            lock_id,
            error = %format!("{err:#}"),
            "failed to release lock acquired after the deadline"
        ),
    }
}

/// Releases the lock when dropped, including during unwinding.
pub struct LockGuard {
    locker: Arc<dyn Locker>,
    lock_id: String,
}

impl LockGuard {
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match self.locker.release(&self.lock_id) {
            Ok(()) => debug!(lock_id = %self.lock_id, "released upgrade lock"),
            Err(err) => warn!(lock_id = %self.lock_id, error = %format!("{err:#}"), "failed to release upgrade lock"),
        }
    }
}

/// Lock backed by a create-new marker file; works across processes sharing a
/// filesystem. A stale marker left by a crashed process has to be removed by
/// an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLock {
    dir: PathBuf,
}

impl FileLock {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, lock_id: &str) -> PathBuf {
        self.dir.join(format!("{lock_id}.lock"))
    }

    pub fn holder(&self, lock_id: &str) -> Result<Option<String>> {
        let path = self.path(lock_id);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw.trim().to_string())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read lock file {}", path.display()))
            }
        }
    }
}

impl Locker for FileLock {
    fn try_acquire(&self, lock_id: &str, _ctx: &CallContext) -> Result<bool> {
        validate_lock_id(lock_id)?;
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.path(lock_id);
        let file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let holder = self.holder(lock_id).ok().flatten().unwrap_or_default();
                debug!(lock_id, holder = %holder, "lock already held");
                return Ok(false);
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to claim lock file {}", path.display()));
            }
        };

        write_marker(&path, file, format!("pid={}\n", std::process::id()).as_bytes())?;
        Ok(true)
    }

    fn release(&self, lock_id: &str) -> Result<()> {
        let path = self.path(lock_id);
        remove_file_if_exists(&path)
            .with_context(|| format!("failed to remove lock file {}", path.display()))
    }
}

/// Fills a freshly claimed marker. A marker that cannot be written is removed
/// again so a failed claim never leaves the lock held.
pub(crate) fn write_marker<W: Write>(path: &Path, mut file: W, contents: &[u8]) -> Result<()> {
    let written = file.write_all(contents).and_then(|()| file.flush());
    drop(file);
    if let Err(err) = written {
        if let Err(cleanup) = remove_file_if_exists(path) {
            warn!(
                path = %path.display(),
                error = %cleanup,
                "failed to remove partially written lock file"
            );
        }
        return Err(err).with_context(|| format!("failed to write lock file {}", path.display()));
    }
    Ok(())
}

fn validate_lock_id(lock_id: &str) -> Result<()> {
    let valid = !lock_id.is_empty()
        && lock_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        && !lock_id.starts_with('.');
    if !valid {
        return Err(anyhow!("invalid lock identifier: '{lock_id}'"));
    }
    Ok(())
}
