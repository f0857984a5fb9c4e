//! Polling loop that feeds newly dropped artifacts to the engine.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info, warn};
use upkeep_core::AttemptOutcome;

use crate::attempt::UpgradeAttempt;
use crate::capabilities::CancelToken;
use crate::engine::UpgradeEngine;

pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(10);

const STOP_POLL: Duration = Duration::from_millis(50);

/// What happens to an artifact once an attempt installed it successfully.
/// Artifacts of failed attempts always stay where they are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProcessedArtifacts {
    #[default]
    Keep,
    Delete,
    MoveTo(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOptions {
    pub interval: Duration,
    pub processed: ProcessedArtifacts,
    /// Stop after this many polls; `None` runs until cancelled.
    pub max_cycles: Option<u64>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_WATCH_INTERVAL,
            processed: ProcessedArtifacts::Keep,
            max_cycles: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchSummary {
    pub cycles: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub degraded: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeenArtifact {
    path: PathBuf,
    modified_at_unix: u64,
}

/// Runs an attempt for every artifact that shows up in the watch directory.
///
/// Each artifact is attempted once per modification time, whatever the
/// outcome, so a failing archive is not retried until it is dropped again.
pub struct Watcher<'a> {
    engine: &'a UpgradeEngine,
    options: WatchOptions,
    seen: HashSet<SeenArtifact>,
}

impl<'a> Watcher<'a> {
    pub fn new(engine: &'a UpgradeEngine, options: WatchOptions) -> Self {
        Self {
            engine,
            options,
            seen: HashSet::new(),
        }
    }

    /// Looks once. Returns the attempt when a new artifact was processed.
    pub fn poll_once(&mut self) -> Result<Option<UpgradeAttempt>> {
        let locator = self.engine.locator();
        let Some(package) = locator.locate()? else {
            debug!(watch_dir = %locator.watch_dir().display(), "no artifact waiting");
            return Ok(None);
        };
        let key = SeenArtifact {
            path: package.path.clone(),
            modified_at_unix: package.modified_at_unix,
        };
        if !self.seen.insert(key) {
            debug!(artifact = %package.path.display(), "artifact already processed");
            return Ok(None);
        }

        info!(artifact = %package.path.display(), "new upgrade artifact detected");
        let attempt = self.engine.run(Some(&package.path))?;
        if attempt.outcome() == Some(AttemptOutcome::Succeeded) {
            self.dispose(&package.path);
        }
        Ok(Some(attempt))
    }

    /// Polls until `stop` is cancelled or `max_cycles` is reached, handing each
    /// finished attempt to `on_attempt`.
    pub fn run(
        &mut self,
        stop: &CancelToken,
        mut on_attempt: impl FnMut(&UpgradeAttempt),
    ) -> WatchSummary {
        let mut summary = WatchSummary::default();
        info!(
            watch_dir = %self.engine.config().watch_dir.display(),
            interval_secs = self.options.interval.as_secs_f64(),
            "watching for upgrade artifacts"
        );

        while !stop.is_cancelled() {
            match self.poll_once() {
                Ok(Some(attempt)) => {
                    match attempt.outcome() {
                        Some(AttemptOutcome::Succeeded) => summary.succeeded += 1,
                        Some(AttemptOutcome::Degraded) => summary.degraded += 1,
                        Some(AttemptOutcome::Failed) | None => summary.failed += 1,
                    }
                    on_attempt(&attempt);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "watch cycle failed");
                    self.engine
                        .emit("watcher_error", json!({ "error": format!("{err:#}") }), true);
                }
            }
            summary.cycles += 1;
            if self
                .options
                .max_cycles
                .is_some_and(|max| summary.cycles >= max)
            {
                break;
            }
            sleep_unless_stopped(self.options.interval, stop);
        }

        info!(cycles = summary.cycles, "stopped watching");
        summary
    }

    fn dispose(&self, artifact: &Path) {
        let result = match &self.options.processed {
            ProcessedArtifacts::Keep => return,
            ProcessedArtifacts::Delete => self.engine.cleanup(artifact),
            ProcessedArtifacts::MoveTo(dir) => {
                self.engine.move_processed(artifact, dir).map(|_| ())
            }
        };
        // Both paths audit their own failure; the next cycle carries on.
        if let Err(err) = result {
            debug!(error = %format!("{err:#}"), "processed artifact left in place");
        }
    }
}

fn sleep_unless_stopped(interval: Duration, stop: &CancelToken) {
    let deadline = Instant::now() + interval;
    while !stop.is_cancelled() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        thread::sleep(remaining.min(STOP_POLL));
    }
}
