// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use fort_core::SIGNATURE_NAMESPACE;
use sha2::{Digest, Sha256};
use std::io::Write as _;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Width, in base64 characters, of each line in the re-armored
/// signature block. Matches the SSH signature armor convention.
const ARMOR_WIDTH: usize = 70;

/// Errors from building or verifying a signed request.
#[derive(Debug, Error)]
pub enum SignError {
    /// The supplied signature was not valid base64.
    #[error("signature is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    /// A scratch file could not be written.
    #[error("failed to write scratch file: {0}")]
    ScratchIo(#[source] std::io::Error),

    /// `ssh-keygen` could not be spawned at all (e.g. not installed).
    #[error("failed to spawn ssh-keygen: {0}")]
    Spawn(#[source] std::io::Error),

    /// `ssh-keygen -Y verify` ran but rejected the signature.
    #[error("ssh-keygen verify: {0}")]
    Rejected(String),
}

/// Build the canonical string that is signed and verified:
/// `METHOD\nPATH\nTIMESTAMP\nHEX(SHA256(BODY))`.
#[must_use]
pub fn canonical_string(method: &str, path: &str, timestamp: &str, body: &[u8]) -> String {
    let body_hash = Sha256::digest(body);
    format!("{method}\n{path}\n{timestamp}\n{body_hash:x}")
}

/// Re-armor raw signature bytes into the standard
/// `-----BEGIN SSH SIGNATURE-----` envelope, 70-column wrapped.
#[must_use]
pub fn armor_signature(raw: &[u8]) -> String {
    let encoded = BASE64.encode(raw);
    let mut out = String::from("-----BEGIN SSH SIGNATURE-----\n");
    for chunk in encoded.as_bytes().chunks(ARMOR_WIDTH) {
        // `chunks` on a UTF-8-safe base64 alphabet never splits a
        // multi-byte char, so this is a plain ASCII slice.
        out.push_str(std::str::from_utf8(chunk).expect("base64 alphabet is ASCII"));
        out.push('\n');
    }
    out.push_str("-----END SSH SIGNATURE-----\n");
    out
}

/// Verify a detached signature for a request against one origin's
/// public key.
///
/// `signature_b64` is the raw, standard-base64-encoded signature as
/// received in the `X-Fort-Signature` header (not yet armored).
/// `pubkey` is the origin's `authorized_keys`-format public key line,
/// as loaded from `hosts.json`.
///
/// # Errors
///
/// Returns [`SignError::InvalidBase64`] if the signature cannot be
/// decoded, [`SignError::ScratchIo`] if the scratch directory cannot
/// be written, [`SignError::Spawn`] if `ssh-keygen` cannot be
/// launched, and [`SignError::Rejected`] if verification fails (bad
/// signature, wrong key, or tampered body).
pub async fn verify(
    origin: &str,
    pubkey: &str,
    method: &str,
    path: &str,
    timestamp: &str,
    body: &[u8],
    signature_b64: &str,
) -> Result<(), SignError> {
    let canonical = canonical_string(method, path, timestamp, body);
    let sig_bytes = BASE64.decode(signature_b64.trim())?;
    let armored = armor_signature(&sig_bytes);

    let scratch = tempfile::Builder::new()
        .prefix("fort-agent-verify-")
        .tempdir()
        .map_err(SignError::ScratchIo)?;

    let allowed_signers_path = scratch.path().join("allowed_signers");
    write_scratch_file(
        &allowed_signers_path,
        format!("{origin} {pubkey}\n").as_bytes(),
    )?;

    let sig_path = scratch.path().join("signature");
    write_scratch_file(&sig_path, armored.as_bytes())?;

    let mut child = Command::new("ssh-keygen")
        .arg("-Y")
        .arg("verify")
        .arg("-f")
        .arg(&allowed_signers_path)
        .arg("-n")
        .arg(SIGNATURE_NAMESPACE)
        .arg("-I")
        .arg(origin)
        .arg("-s")
        .arg(&sig_path)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(SignError::Spawn)?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(canonical.as_bytes()).await;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(SignError::Spawn)?;

    if output.status.success() {
        Ok(())
    } else {
        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);
        Err(SignError::Rejected(
            String::from_utf8_lossy(&combined).trim().to_string(),
        ))
    }
}

fn write_scratch_file(path: &std::path::Path, content: &[u8]) -> Result<(), SignError> {
    let mut file = std::fs::File::create(path).map_err(SignError::ScratchIo)?;
    file.write_all(content).map_err(SignError::ScratchIo)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))
            .map_err(SignError::ScratchIo)?;
    }
    Ok(())
}
