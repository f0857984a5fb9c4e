use anyhow::{anyhow, Context};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

/// Archive entry that carries the optional upgrade manifest.
pub const MANIFEST_ENTRY: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpgradeManifest {
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub compatibility: Compatibility,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Compatibility {
    /// Requirement the currently installed version must satisfy.
    pub requires: Option<VersionReq>,
}

impl UpgradeManifest {
    pub fn from_json_slice(input: &[u8]) -> anyhow::Result<Self> {
        let manifest: Self =
            serde_json::from_slice(input).context("failed to parse upgrade manifest")?;
        if manifest.name.trim().is_empty() {
            return Err(anyhow!("upgrade manifest name must not be empty"));
        }
        Ok(manifest)
    }

    /// Whether `installed` may be upgraded in place by this manifest.
    pub fn accepts_installed(&self, installed: &Version) -> bool {
        self.compatibility
            .requires
            .as_ref()
            .is_none_or(|requirement| requirement.matches(installed))
    }
}
