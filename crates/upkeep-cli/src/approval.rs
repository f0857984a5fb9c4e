use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use upkeep_engine::{Approver, CallContext};

/// Asks on the terminal before an upgrade proceeds. No answer before the
/// approval timeout counts as a denial.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PromptApprover;

impl Approver for PromptApprover {
    fn approve(&self, artifact: &Path, _ctx: &CallContext) -> Result<bool> {
        let mut stderr = io::stderr();
        write!(stderr, "apply upgrade from {}? [y/N] ", artifact.display())
            .context("failed to write approval prompt")?;
        stderr.flush().context("failed to flush approval prompt")?;

        let mut answer = String::new();
        io::stdin()
            .read_line(&mut answer)
            .context("failed to read approval answer")?;
        Ok(is_affirmative(&answer))
    }
}

pub(crate) fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
