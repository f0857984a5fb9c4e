use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use semver::Version;
use tracing::{debug, warn};
use upkeep_core::{UpgradeManifest, MANIFEST_ENTRY};
use upkeep_security::{read_signature_file, verify_ed25519_file_signature};

use crate::capabilities::{CallContext, ManifestCheck, SignatureCheck};

/// Detached ed25519 signature over the artifact bytes.
///
/// The signature is looked up next to the artifact (`<artifact>.sig`) and then
/// in `signatures_dir` (`<file name>.sig`). A missing signature fails the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ed25519Signature {
    public_key_hex: String,
    signatures_dir: Option<PathBuf>,
}

impl Ed25519Signature {
    pub fn new(public_key_hex: impl Into<String>, signatures_dir: Option<PathBuf>) -> Self {
        Self {
            public_key_hex: public_key_hex.into(),
            signatures_dir,
        }
    }

    pub fn signature_candidates(&self, artifact: &Path) -> Vec<PathBuf> {
        let mut candidates = vec![signature_sidecar_path(artifact)];
        if let (Some(dir), Some(file_name)) = (&self.signatures_dir, artifact.file_name()) {
            let mut name = file_name.to_os_string();
            name.push(".sig");
            candidates.push(dir.join(name));
        }
        candidates
    }
}

impl SignatureCheck for Ed25519Signature {
    fn verify(&self, artifact: &Path, _ctx: &CallContext) -> Result<bool> {
        let Some(signature_path) = self
            .signature_candidates(artifact)
            .into_iter()
            .find(|candidate| candidate.is_file())
        else {
            warn!(artifact = %artifact.display(), "no signature found for artifact");
            return Ok(false);
        };

        let signature_hex = read_signature_file(&signature_path)?;
        let verified =
            verify_ed25519_file_signature(artifact, &self.public_key_hex, &signature_hex)?;
        debug!(
            artifact = %artifact.display(),
            signature = %signature_path.display(),
            verified,
            "checked artifact signature"
        );
        Ok(verified)
    }
}

/// `<artifact>.sig`, the sidecar the packaging step drops next to an artifact.
pub fn signature_sidecar_path(artifact: &Path) -> PathBuf {
    let mut raw = artifact.as_os_str().to_os_string();
    raw.push(".sig");
    PathBuf::from(raw)
}

/// Version and compatibility policy for manifests.
///
/// With an installed version known, the candidate must be strictly newer and
/// its `compatibility.requires` must match the installed version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionGate {
    expected_name: Option<String>,
    installed: Option<Version>,
}

impl VersionGate {
    pub fn new(expected_name: Option<String>, installed: Option<Version>) -> Self {
        Self {
            expected_name,
            installed,
        }
    }

    /// Reads the installed version from the manifest a previous upgrade left in
    /// the installation directory, if any.
    pub fn from_install_dir(install_dir: &Path, expected_name: Option<String>) -> Result<Self> {
        let path = install_dir.join(MANIFEST_ENTRY);
        let installed = match std::fs::read(&path) {
            Ok(raw) => Some(
                UpgradeManifest::from_json_slice(&raw)
                    .with_context(|| format!("invalid installed manifest {}", path.display()))?
                    .version,
            ),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read installed manifest {}", path.display()));
            }
        };
        Ok(Self::new(expected_name, installed))
    }

    pub fn installed(&self) -> Option<&Version> {
        self.installed.as_ref()
    }

    pub fn evaluate(&self, manifest: &UpgradeManifest) -> Result<(), String> {
        if let Some(expected) = &self.expected_name {
            if &manifest.name != expected {
                return Err(format!(
                    "manifest is for '{}' but this installation is '{expected}'",
                    manifest.name
                ));
            }
        }

        let Some(installed) = &self.installed else {
            return Ok(());
        };
        if manifest.version <= *installed {
            return Err(format!(
                "version {} is not newer than installed {installed}",
                manifest.version
            ));
        }
        if !manifest.accepts_installed(installed) {
            return Err(format!(
                "version {} cannot upgrade installed {installed}",
                manifest.version
            ));
        }
        Ok(())
    }
}

impl ManifestCheck for VersionGate {
    fn check(&self, manifest: &UpgradeManifest, _ctx: &CallContext) -> Result<bool> {
        match self.evaluate(manifest) {
            Ok(()) => Ok(true),
            Err(reason) => {
                warn!(name = %manifest.name, version = %manifest.version, %reason, "manifest rejected");
                Ok(false)
            }
        }
    }
}
