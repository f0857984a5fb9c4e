use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeErrorKind {
    NoPackageFound,
    ApprovalDenied,
    LockUnavailable,
    SignatureInvalid,
    ManifestIncompatible,
    BackupFailed,
    InstallFailed,
    HealthCheckFailed,
    RollbackFailed,
}

impl UpgradeErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoPackageFound => "no_package_found",
            Self::ApprovalDenied => "approval_denied",
            Self::LockUnavailable => "lock_unavailable",
            Self::SignatureInvalid => "signature_invalid",
            Self::ManifestIncompatible => "manifest_incompatible",
            Self::BackupFailed => "backup_failed",
            Self::InstallFailed => "install_failed",
            Self::HealthCheckFailed => "health_check_failed",
            Self::RollbackFailed => "rollback_failed",
        }
    }

    /// Audit action recorded when an attempt stops with this kind.
    pub fn audit_action(self) -> &'static str {
        match self {
            Self::NoPackageFound => "no_package_found",
            Self::ApprovalDenied => "upgrade_denied",
            Self::LockUnavailable => "lock_failed",
            Self::SignatureInvalid => "signature_failed",
            Self::ManifestIncompatible => "manifest_failed",
            Self::BackupFailed => "backup_failed",
            Self::InstallFailed => "upgrade_failed",
            Self::HealthCheckFailed => "health_failed",
            Self::RollbackFailed => "rollback_failed",
        }
    }

    pub fn triggers_rollback(self) -> bool {
        matches!(self, Self::InstallFailed | Self::HealthCheckFailed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{}: {message}", .kind.as_str())]
pub struct AttemptError {
    pub kind: UpgradeErrorKind,
    pub message: String,
}

impl AttemptError {
    pub fn new(kind: UpgradeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Keeps the whole context chain of an `anyhow` error in the message.
    pub fn from_anyhow(kind: UpgradeErrorKind, err: &anyhow::Error) -> Self {
        Self::new(kind, format!("{err:#}"))
    }
}
