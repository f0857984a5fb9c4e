use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Idle,
    Located,
    Validated,
    Locked,
    BackedUp,
    Installing,
    Installed,
    HealthChecking,
    Succeeded,
    RollingBack,
    RolledBack,
    RollbackFailed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    /// The upgrade did not land but the installation is back in its prior state.
    Failed,
    /// Rollback itself failed; neither the old nor the new state is confirmed.
    Degraded,
}

impl AttemptState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Located => "located",
            Self::Validated => "validated",
            Self::Locked => "locked",
            Self::BackedUp => "backed_up",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::HealthChecking => "health_checking",
            Self::Succeeded => "succeeded",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::RollbackFailed => "rollback_failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "idle" => Ok(Self::Idle),
            "located" => Ok(Self::Located),
            "validated" => Ok(Self::Validated),
            "locked" => Ok(Self::Locked),
            "backed_up" => Ok(Self::BackedUp),
            "installing" => Ok(Self::Installing),
            "installed" => Ok(Self::Installed),
            "health_checking" => Ok(Self::HealthChecking),
            "succeeded" => Ok(Self::Succeeded),
            "rolling_back" => Ok(Self::RollingBack),
            "rolled_back" => Ok(Self::RolledBack),
            "rollback_failed" => Ok(Self::RollbackFailed),
            "aborted" => Ok(Self::Aborted),
            _ => Err(anyhow!("invalid attempt state: {value}")),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::RolledBack | Self::RollbackFailed | Self::Aborted
        )
    }

    /// Legal edges of the attempt lifecycle. Nothing leaves a terminal state,
    /// and nothing reaches `Aborted` once the installation may have been touched.
    pub fn can_advance_to(self, next: Self) -> bool {
        use AttemptState::*;

        matches!(
            (self, next),
            (Idle, Located)
                | (Located, Validated)
                | (Validated, Locked)
                | (Locked, BackedUp)
                | (BackedUp, Installing)
                | (Installing, Installed)
                | (Installed, HealthChecking)
                | (HealthChecking, Succeeded)
                | (Installing | Installed | HealthChecking, RollingBack)
                | (RollingBack, RolledBack | RollbackFailed)
                | (Idle | Located | Validated | Locked | BackedUp, Aborted)
        )
    }

    /// Outcome implied by a terminal state.
    pub fn outcome(self) -> Option<AttemptOutcome> {
        match self {
            Self::Succeeded => Some(AttemptOutcome::Succeeded),
            Self::RolledBack | Self::Aborted => Some(AttemptOutcome::Failed),
            Self::RollbackFailed => Some(AttemptOutcome::Degraded),
            _ => None,
        }
    }
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Degraded => "degraded",
        }
    }
}
