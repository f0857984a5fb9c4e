use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::UpgradeManifest;

/// One located upgrade artifact. The manifest is attached once the archive has
/// been read by the integrity gates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpgradePackage {
    pub path: PathBuf,
    pub file_name: String,
    pub modified_at_unix: u64,
    pub discovered_at_unix: u64,
    pub manifest: Option<UpgradeManifest>,
}

impl UpgradePackage {
    pub fn with_manifest(mut self, manifest: Option<UpgradeManifest>) -> Self {
        self.manifest = manifest;
        self
    }

    pub fn manifest_version(&self) -> Option<String> {
        self.manifest
            .as_ref()
            .map(|manifest| manifest.version.to_string())
    }
}
