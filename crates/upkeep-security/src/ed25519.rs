use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

pub fn verify_ed25519_signature_hex(
    payload: &[u8],
    public_key_hex: &str,
    signature_hex: &str,
) -> Result<bool> {
    let verifying_key = decode_public_key(public_key_hex)?;
    let signature = decode_signature(signature_hex)?;
    Ok(verifying_key.verify(payload, &signature).is_ok())
}

/// Verifies a detached signature over the full contents of `artifact_path`.
pub fn verify_ed25519_file_signature(
    artifact_path: &Path,
    public_key_hex: &str,
    signature_hex: &str,
) -> Result<bool> {
    let payload = fs::read(artifact_path)
        .with_context(|| format!("failed to read signed artifact {}", artifact_path.display()))?;
    verify_ed25519_signature_hex(&payload, public_key_hex, signature_hex)
}

/// Reads a hex signature file, tolerating surrounding whitespace and a trailing newline.
pub fn read_signature_file(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read signature file {}", path.display()))?;
    let signature = raw.trim();
    if signature.is_empty() {
        return Err(anyhow!("signature file is empty: {}", path.display()));
    }
    Ok(signature.to_string())
}

fn decode_public_key(public_key_hex: &str) -> Result<VerifyingKey> {
    let bytes =
        hex::decode(public_key_hex.trim()).context("failed to decode Ed25519 public key hex")?;
    let len = bytes.len();
    let array: [u8; 32] = bytes.try_into().map_err(|_| {
        anyhow!("invalid Ed25519 public key length: expected 32 bytes, got {len}")
    })?;
    VerifyingKey::from_bytes(&array).context("invalid Ed25519 public key bytes")
}

fn decode_signature(signature_hex: &str) -> Result<Signature> {
    let bytes =
        hex::decode(signature_hex.trim()).context("failed to decode Ed25519 signature hex")?;
    let len = bytes.len();
    let array: [u8; 64] = bytes.try_into().map_err(|_| {
        anyhow!("invalid Ed25519 signature length: expected 64 bytes, got {len}")
    })?;
    Ok(Signature::from_bytes(&array))
}
