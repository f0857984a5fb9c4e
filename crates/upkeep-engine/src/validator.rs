use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};
use upkeep_core::{AttemptError, UpgradeErrorKind, UpgradeManifest, UpgradePackage, MANIFEST_ENTRY};
use zip::result::ZipError;
use zip::ZipArchive;

use crate::capabilities::{call_bounded, ManifestCheck, SignatureCheck};

/// Runs the signature gate and then the manifest gate. Neither touches the
/// installation directory.
pub struct IntegrityValidator {
    signature: Arc<dyn SignatureCheck>,
    manifest: Arc<dyn ManifestCheck>,
    signature_timeout: Duration,
    manifest_timeout: Duration,
}

impl IntegrityValidator {
    pub fn new(
        signature: Arc<dyn SignatureCheck>,
        manifest: Arc<dyn ManifestCheck>,
        signature_timeout: Duration,
        manifest_timeout: Duration,
    ) -> Self {
        Self {
            signature,
            manifest,
            signature_timeout,
            manifest_timeout,
        }
    }

    /// Returns the package with its parsed manifest attached.
    pub fn validate(&self, package: UpgradePackage) -> Result<UpgradePackage, AttemptError> {
        self.check_signature(&package.path)?;
        let manifest = self.check_manifest(&package.path)?;
        Ok(package.with_manifest(manifest))
    }

    fn check_signature(&self, artifact: &Path) -> Result<(), AttemptError> {
        let signature = Arc::clone(&self.signature);
        let owned = artifact.to_path_buf();
        let verified = call_bounded("signature", self.signature_timeout, move |ctx| {
            signature.verify(&owned, ctx)
        });
        match verified {
            Ok(true) => Ok(()),
            Ok(false) => Err(AttemptError::new(
                UpgradeErrorKind::SignatureInvalid,
                format!("signature rejected for {}", artifact.display()),
            )),
            Err(err) => {
                let err = err.context(format!(
                    "signature check failed for {}",
                    artifact.display()
                ));
                Err(AttemptError::from_anyhow(
                    UpgradeErrorKind::SignatureInvalid,
                    &err,
                ))
            }
        }
    }

    fn check_manifest(&self, artifact: &Path) -> Result<Option<UpgradeManifest>, AttemptError> {
        let manifest = read_manifest_entry(artifact).map_err(|err| {
            AttemptError::from_anyhow(UpgradeErrorKind::ManifestIncompatible, &err)
        })?;
        let Some(manifest) = manifest else {
            debug!(artifact = %artifact.display(), "no manifest entry; manifest gate passes");
            return Ok(None);
        };

        let check = Arc::clone(&self.manifest);
        let probe_manifest = manifest.clone();
        let accepted = call_bounded("manifest", self.manifest_timeout, move |ctx| {
            check.check(&probe_manifest, ctx)
        });
        match accepted {
            Ok(true) => Ok(Some(manifest)),
            Ok(false) => Err(AttemptError::new(
                UpgradeErrorKind::ManifestIncompatible,
                format!(
                    "manifest {} {} rejected for {}",
                    manifest.name,
                    manifest.version,
                    artifact.display()
                ),
            )),
            Err(err) => {
                warn!(artifact = %artifact.display(), error = %err, "manifest check errored");
                Err(AttemptError::from_anyhow(
                    UpgradeErrorKind::ManifestIncompatible,
                    &err,
                ))
            }
        }
    }
}

/// Reads and parses the optional manifest entry. `Ok(None)` means the archive
/// has no manifest; an unreadable archive or a malformed manifest is an error.
pub fn read_manifest_entry(artifact: &Path) -> Result<Option<UpgradeManifest>> {
    let file = File::open(artifact)
        .with_context(|| format!("failed to open upgrade artifact {}", artifact.display()))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("failed to read zip archive {}", artifact.display()))?;
    let mut entry = match archive.by_name(MANIFEST_ENTRY) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| {
                format!(
                    "failed to read {MANIFEST_ENTRY} from {}",
                    artifact.display()
                )
            });
        }
    };

    let mut raw = Vec::new();
    entry.read_to_end(&mut raw).with_context(|| {
        format!(
            "failed to read {MANIFEST_ENTRY} from {}",
            artifact.display()
        )
    })?;
    let manifest = UpgradeManifest::from_json_slice(&raw)
        .with_context(|| format!("invalid {MANIFEST_ENTRY} in {}", artifact.display()))?;
    Ok(Some(manifest))
}
