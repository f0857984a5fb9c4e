use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};
use upkeep_core::{AttemptError, UpgradeErrorKind};

use crate::capabilities::{call_bounded, CallContext, HealthProbe};

pub struct HealthChecker {
    probe: Arc<dyn HealthProbe>,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(probe: Arc<dyn HealthProbe>, timeout: Duration) -> Self {
        Self { probe, timeout }
    }

    pub fn check(&self) -> Result<(), AttemptError> {
        let probe = Arc::clone(&self.probe);
        match call_bounded("health", self.timeout, move |ctx| probe.probe(ctx)) {
            Ok(true) => Ok(()),
            Ok(false) => Err(AttemptError::new(
                UpgradeErrorKind::HealthCheckFailed,
                "health probe reported the new installation unhealthy",
            )),
            Err(err) => Err(AttemptError::from_anyhow(
                UpgradeErrorKind::HealthCheckFailed,
                &err.context("health probe did not complete"),
            )),
        }
    }
}

/// Runs a program and treats a zero exit status as healthy. The child is
/// killed if the call deadline passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandProbe {
    program: String,
    args: Vec<String>,
}

impl CommandProbe {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Builds a probe from `[program, args...]` as written in configuration.
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("health command must name a program"))?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }
}

impl HealthProbe for CommandProbe {
    fn probe(&self, ctx: &CallContext) -> Result<bool> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to start health command '{}'", self.program))?;

        loop {
            if let Some(status) = child
                .try_wait()
                .with_context(|| format!("failed to wait on health command '{}'", self.program))?
            {
                debug!(program = %self.program, %status, "health command exited");
                return Ok(status.success());
            }
            if ctx.should_stop() {
                warn!(program = %self.program, "health command exceeded its deadline; killing it");
                let _ = child.kill();
                let _ = child.wait();
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}
