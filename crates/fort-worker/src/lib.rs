// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use fort_core::{AsyncFormat, ProviderStateEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::warn;

/// Environment variable carrying the capability name.
pub const ENV_CAPABILITY: &str = "FORT_CAPABILITY";
/// Environment variable carrying the triggering origin, when present.
pub const ENV_ORIGIN: &str = "FORT_ORIGIN";
/// Environment variable set to `async` for async-mode invocations.
pub const ENV_MODE: &str = "FORT_MODE";
/// Environment variable carrying the sweep kind, when invoked outside
/// a live request.
pub const ENV_TRIGGER: &str = "FORT_TRIGGER";
/// Environment variable carrying the need-id for a need-handler
/// invocation.
pub const ENV_NEED_ID: &str = "FORT_NEED_ID";

/// How a worker invocation was triggered when there is no live HTTP
/// request behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// Once, on broker start, for capabilities with `triggers.initialize`.
    Initialize,
    /// Via `--trigger <capability>`, typically from a systemd unit.
    Systemd,
    /// Via `--gc`.
    Gc,
}

impl TriggerKind {
    /// The value written to [`ENV_TRIGGER`].
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Systemd => "systemd",
            Self::Gc => "gc",
        }
    }
}

/// Errors from spawning or communicating with a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker executable could not be spawned.
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),
    /// Writing to or reading from the worker's stdio failed.
    #[error("worker i/o error: {0}")]
    Io(#[source] std::io::Error),
    /// The worker exited non-zero.
    #[error("worker exited with status {code:?}: {stderr}")]
    NonZeroExit {
        /// Exit code, if the process was not killed by a signal.
        code: Option<i32>,
        /// Trimmed stderr output, included in the error surfaced to
        /// the caller per the broker's error-handling design.
        stderr: String,
    },
    /// The worker's stdout did not parse into the expected shape.
    #[error("worker produced malformed output: {0}")]
    MalformedOutput(String),
}

/// One entry of the async input envelope sent to a worker: the
/// request currently on file for this key, and its last-known
/// response, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AsyncInputEntry {
    request: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response: Option<serde_json::Value>,
}

fn build_input_envelope(
    snapshot: &BTreeMap<String, ProviderStateEntry>,
) -> BTreeMap<String, AsyncInputEntry> {
    snapshot
        .iter()
        .map(|(key, entry)| {
            (
                key.clone(),
                AsyncInputEntry {
                    request: entry.request.clone(),
                    response: entry.response.clone(),
                },
            )
        })
        .collect()
}

/// Symmetric-format output entry: `{request, response}`, with
/// `request` echoed back and ignored by the broker.
#[derive(Debug, Deserialize)]
struct SymmetricOutputEntry {
    #[allow(dead_code)]
    request: serde_json::Value,
    response: serde_json::Value,
}

/// Run an RPC capability: write `body` to the worker's stdin and
/// return its stdout verbatim.
///
/// # Errors
///
/// See [`WorkerError`].
pub async fn run_rpc(
    handler_path: &Path,
    capability: &str,
    origin: &str,
    body: &[u8],
) -> Result<Vec<u8>, WorkerError> {
    let mut cmd = Command::new(handler_path);
    cmd.env(ENV_CAPABILITY, capability)
        .env(ENV_ORIGIN, origin)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let output = spawn_write_collect(cmd, body).await?;
    log_stderr(capability, &output.stderr);

    if output.status.success() {
        Ok(output.stdout)
    } else {
        Err(WorkerError::NonZeroExit {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Run an async capability's worker over the current state snapshot,
/// returning a normalized `key -> response` map regardless of the
/// capability's wire `format`.
///
/// `origin` is the triggering origin for a live request, or `None`
/// for a sweep with no single triggering caller. `trigger` is set for
/// every non-request-driven invocation.
///
/// # Errors
///
/// Returns [`WorkerError::MalformedOutput`] if the worker's stdout
/// does not match the capability's declared `format`.
pub async fn run_async(
    handler_path: &Path,
    capability: &str,
    origin: Option<&str>,
    trigger: Option<TriggerKind>,
    format: AsyncFormat,
    snapshot: &BTreeMap<String, ProviderStateEntry>,
) -> Result<BTreeMap<String, serde_json::Value>, WorkerError> {
    let envelope = build_input_envelope(snapshot);
    let input = serde_json::to_vec(&envelope)
        .map_err(|e| WorkerError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

    let mut cmd = Command::new(handler_path);
    cmd.env(ENV_CAPABILITY, capability)
        .env(ENV_MODE, "async")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(origin) = origin {
        cmd.env(ENV_ORIGIN, origin);
    }
    if let Some(trigger) = trigger {
        cmd.env(ENV_TRIGGER, trigger.as_str());
    }

    let output = spawn_write_collect(cmd, &input).await?;
    log_stderr(capability, &output.stderr);

    if !output.status.success() {
        return Err(WorkerError::NonZeroExit {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    match format {
        AsyncFormat::Legacy => serde_json::from_slice::<BTreeMap<String, serde_json::Value>>(
            &output.stdout,
        )
        .map_err(|e| WorkerError::MalformedOutput(e.to_string())),
        AsyncFormat::Symmetric => {
            let raw: BTreeMap<String, SymmetricOutputEntry> =
                serde_json::from_slice(&output.stdout)
                    .map_err(|e| WorkerError::MalformedOutput(e.to_string()))?;
            Ok(raw.into_iter().map(|(k, v)| (k, v.response)).collect())
        }
    }
}

/// Invoke a need's satisfaction handler. Exit status `0` means the
/// need is now satisfied; any other exit means it is not.
///
/// # Errors
///
/// Returns [`WorkerError::Spawn`]/[`WorkerError::Io`] if the handler
/// cannot be run at all. A non-zero exit is not itself an error here
/// — it is the signal that the need is unsatisfied — so this function
/// never returns [`WorkerError::NonZeroExit`].
pub async fn run_need_handler(
    handler_path: &Path,
    need_id: &str,
    capability: &str,
    origin: &str,
    body: &[u8],
) -> Result<bool, WorkerError> {
    let mut cmd = Command::new(handler_path);
    cmd.env(ENV_NEED_ID, need_id)
        .env(ENV_CAPABILITY, capability)
        .env(ENV_ORIGIN, origin)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let output = spawn_write_collect(cmd, body).await?;
    log_stderr(capability, &output.stderr);
    Ok(output.status.success())
}

/// Spawn `cmd`, writing `stdin_data` and draining stdout/stderr
/// concurrently so a worker that writes more than one pipe buffer
/// before it has finished reading stdin cannot deadlock against us.
async fn spawn_write_collect(
    mut cmd: Command,
    stdin_data: &[u8],
) -> Result<std::process::Output, WorkerError> {
    let mut child = cmd.spawn().map_err(WorkerError::Spawn)?;
    let mut stdin = child.stdin.take();
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let write_stdin = async {
        if let Some(stdin) = stdin.as_mut() {
            stdin.write_all(stdin_data).await?;
        }
        // Drop to close the pipe so the child sees EOF.
        stdin.take();
        Ok::<(), std::io::Error>(())
    };
    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(stdout) = stdout.as_mut() {
            stdout.read_to_end(&mut buf).await?;
        }
        Ok::<Vec<u8>, std::io::Error>(buf)
    };
    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(stderr) = stderr.as_mut() {
            stderr.read_to_end(&mut buf).await?;
        }
        Ok::<Vec<u8>, std::io::Error>(buf)
    };

    let (write_res, stdout_res, stderr_res) = tokio::join!(write_stdin, read_stdout, read_stderr);
    write_res.map_err(WorkerError::Io)?;
    let stdout = stdout_res.map_err(WorkerError::Io)?;
    let stderr = stderr_res.map_err(WorkerError::Io)?;
    let status = child.wait().await.map_err(WorkerError::Io)?;
    Ok(std::process::Output { status, stdout, stderr })
}

fn log_stderr(capability: &str, stderr: &[u8]) {
    if stderr.is_empty() {
        return;
    }
    for line in String::from_utf8_lossy(stderr).lines() {
        if !line.trim().is_empty() {
            warn!(target: "fort.worker.stderr", capability, "{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fort_core::ProviderStateEntry;
    use std::fs;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn rpc_echoes_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo.sh", "#!/bin/sh\ncat\n");
        let out = run_rpc(&script, "echoer", "alpha", b"hello").await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn rpc_non_zero_exit_surfaces_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "fail.sh",
            "#!/bin/sh\necho 'bad input' 1>&2\nexit 1\n",
        );
        let err = run_rpc(&script, "failer", "alpha", b"x").await.unwrap_err();
        match err {
            WorkerError::NonZeroExit { code, stderr } => {
                assert_eq!(code, Some(1));
                assert_eq!(stderr, "bad input");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn async_legacy_format_normalizes_directly() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "legacy.sh",
            "#!/bin/sh\necho '{\"alpha\": {\"token\": \"t1\"}}'\n",
        );
        let mut snapshot = BTreeMap::new();
        snapshot.insert(
            "alpha".to_string(),
            ProviderStateEntry {
                request: serde_json::json!({}),
                response: None,
                updated_at: 1,
            },
        );
        let result = run_async(
            &script,
            "tokens",
            Some("alpha"),
            None,
            AsyncFormat::Legacy,
            &snapshot,
        )
        .await
        .unwrap();
        assert_eq!(result["alpha"], serde_json::json!({"token": "t1"}));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn async_symmetric_format_extracts_response() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "symmetric.sh",
            "#!/bin/sh\necho '{\"alpha\": {\"request\": {}, \"response\": {\"token\": \"t1\"}}}'\n",
        );
        let snapshot = BTreeMap::new();
        let result = run_async(
            &script,
            "tokens",
            None,
            Some(TriggerKind::Gc),
            AsyncFormat::Symmetric,
            &snapshot,
        )
        .await
        .unwrap();
        assert_eq!(result["alpha"], serde_json::json!({"token": "t1"}));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn malformed_output_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "junk.sh", "#!/bin/sh\necho 'not json'\n");
        let snapshot = BTreeMap::new();
        let result = run_async(
            &script,
            "tokens",
            None,
            None,
            AsyncFormat::Legacy,
            &snapshot,
        )
        .await;
        assert!(matches!(result, Err(WorkerError::MalformedOutput(_))));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn need_handler_exit_status_maps_to_satisfaction() {
        let dir = tempfile::tempdir().unwrap();
        let ok = write_script(dir.path(), "ok.sh", "#!/bin/sh\nexit 0\n");
        let fail = write_script(dir.path(), "fail.sh", "#!/bin/sh\nexit 1\n");
        assert!(
            run_need_handler(&ok, "tokens-ci", "tokens", "builder", b"{}")
                .await
                .unwrap()
        );
        assert!(
            !run_need_handler(&fail, "tokens-ci", "tokens", "builder", b"{}")
                .await
                .unwrap()
        );
    }
}
