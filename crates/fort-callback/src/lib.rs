// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::warn;

/// Default channel capacity for the callback dispatcher.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Errors from invoking the local signing-client adapter.
#[derive(Debug, Error)]
pub enum SigningClientError {
    /// The signing-client executable could not be spawned.
    #[error("failed to spawn signing client: {0}")]
    Spawn(#[source] std::io::Error),
    /// Writing to or reading from the signing client's stdio failed.
    #[error("signing client i/o error: {0}")]
    Io(#[source] std::io::Error),
    /// The GC-mode `GET /fort/needs` envelope was not valid JSON, or
    /// its `status` fell outside `[200, 300)`.
    #[error("signing client returned an unusable response: {0}")]
    BadResponse(String),
}

/// The `{"body": ..., "status": ...}` envelope the signing client
/// writes to stdout for a query the broker reads a response from.
#[derive(Debug, Deserialize)]
struct Envelope {
    body: String,
    status: u16,
}

/// Adapter around the local signing-client executable: builds and
/// signs outbound requests to remote hosts on the broker's behalf.
///
/// The broker never implements signing itself — it shells out to
/// `signing_client_path` (default `fort-client`, resolved on `PATH`)
/// exactly the way [`fort_sign`](../fort_sign/index.html) delegates
/// verification to `ssh-keygen`.
#[derive(Debug, Clone)]
pub struct SigningClient {
    path: PathBuf,
}

impl SigningClient {
    /// Point the adapter at a signing-client executable.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Fire-and-forget `POST <path>` to `host` with `body` on stdin.
    ///
    /// The broker never reads stdout for this call. A non-zero exit
    /// is reported so the caller can log it, but is not itself
    /// propagated as a dispatch failure — the next trigger or GC
    /// sweep will re-send.
    ///
    /// # Errors
    ///
    /// Returns [`SigningClientError::Spawn`] if the executable cannot
    /// be launched at all.
    pub async fn post(&self, host: &str, path: &str, body: &[u8]) -> Result<(), SigningClientError> {
        let output = self.run(host, "POST", path, body).await?;
        if !output.status.success() {
            warn!(
                target: "fort.callback",
                host,
                path,
                code = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "signing client exited non-zero"
            );
        }
        Ok(())
    }

    /// `GET /fort/needs` on `host`, used by the GC sweep to reconcile
    /// declared needs against provider state.
    ///
    /// # Errors
    ///
    /// Returns [`SigningClientError::Spawn`]/[`SigningClientError::Io`]
    /// if the client cannot be run, or
    /// [`SigningClientError::BadResponse`] if its stdout envelope is
    /// malformed or its reported `status` falls outside `[200, 300)`
    /// — both are treated identically to a network failure by the
    /// caller (origin unreachable for this sweep pass).
    pub async fn get_needs(&self, host: &str) -> Result<Vec<String>, SigningClientError> {
        let output = self.run(host, "GET", "/fort/needs", b"").await?;
        if !output.status.success() {
            return Err(SigningClientError::BadResponse(format!(
                "exit status {:?}",
                output.status.code()
            )));
        }
        let envelope: Envelope = serde_json::from_slice(&output.stdout)
            .map_err(|e| SigningClientError::BadResponse(e.to_string()))?;
        if !(200..300).contains(&envelope.status) {
            return Err(SigningClientError::BadResponse(format!(
                "remote status {}",
                envelope.status
            )));
        }
        let parsed: NeedsResponse = serde_json::from_str(&envelope.body)
            .map_err(|e| SigningClientError::BadResponse(e.to_string()))?;
        Ok(parsed.needs)
    }

    /// Spawned so writing `body` and draining stdout/stderr happen
    /// concurrently; a client that replies with more than one pipe
    /// buffer of output before finishing reading stdin would otherwise
    /// deadlock against us.
    async fn run(
        &self,
        host: &str,
        method: &str,
        path: &str,
        body: &[u8],
    ) -> Result<std::process::Output, SigningClientError> {
        let mut child = Command::new(&self.path)
            .arg(host)
            .arg(method)
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(SigningClientError::Spawn)?;

        let mut stdin = child.stdin.take();
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let write_stdin = async {
            if let Some(stdin) = stdin.as_mut() {
                stdin.write_all(body).await?;
            }
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

        let (write_res, stdout_res, stderr_res) =
            tokio::join!(write_stdin, read_stdout, read_stderr);
        write_res.map_err(SigningClientError::Io)?;
        let stdout = stdout_res.map_err(SigningClientError::Io)?;
        let stderr = stderr_res.map_err(SigningClientError::Io)?;
        let status = child.wait().await.map_err(SigningClientError::Io)?;
        Ok(std::process::Output { status, stdout, stderr })
    }
}

/// The `{needs: [...]}` shape a remote broker's `GET /fort/needs`
/// response body parses into.
#[derive(Debug, Deserialize)]
struct NeedsResponse {
    needs: Vec<String>,
}

/// One queued outbound fulfillment callback.
#[derive(Debug, Clone)]
pub struct CallbackJob {
    /// Destination host (the key's origin).
    pub host: String,
    /// Capability the need belongs to.
    pub capability: String,
    /// The `<name>` portion of the need-id (prefix already stripped).
    pub need_name: String,
    /// Response body to deliver. Revocations use `{}`.
    pub body: serde_json::Value,
}

impl CallbackJob {
    /// The inbound-shaped callback path: `/fort/needs/<capability>/<name>`.
    #[must_use]
    pub fn path(&self) -> String {
        format!("/fort/needs/{}/{}", self.capability, self.need_name)
    }
}

/// Snapshot of dispatcher queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Total jobs successfully enqueued.
    pub enqueued: u64,
    /// Jobs dropped because the queue was full.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

/// Fire-and-forget outbound callback dispatcher.
///
/// Enqueuing never blocks the request path: [`CallbackDispatcher::enqueue`]
/// uses a bounded channel and drops the job (logging a warning) rather
/// than apply backpressure to the caller.
#[derive(Clone)]
pub struct CallbackDispatcher {
    tx: mpsc::Sender<CallbackJob>,
    stats: Arc<StatsInner>,
}

impl CallbackDispatcher {
    /// Spawn the background drain task and return a dispatcher handle.
    ///
    /// `signing_client` is cloned into the background task; callers
    /// keep their own handle to invoke it directly for synchronous
    /// work (e.g. GC's `GET /fort/needs`).
    #[must_use]
    pub fn spawn(signing_client: SigningClient) -> Self {
        Self::spawn_with_capacity(signing_client, DEFAULT_QUEUE_CAPACITY)
    }

    /// As [`CallbackDispatcher::spawn`], with an explicit queue capacity.
    #[must_use]
    pub fn spawn_with_capacity(signing_client: SigningClient, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<CallbackJob>(capacity);
        let stats = Arc::new(StatsInner::default());

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let path = job.path();
                let body = match serde_json::to_vec(&job.body) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(target: "fort.callback", error = %e, "failed to serialize callback body");
                        continue;
                    }
                };
                if let Err(e) = signing_client.post(&job.host, &path, &body).await {
                    warn!(
                        target: "fort.callback",
                        host = %job.host,
                        path = %path,
                        error = %e,
                        "callback dispatch failed; next sweep will retry"
                    );
                }
            }
        });

        Self { tx, stats }
    }

    /// Enqueue a callback job. Returns immediately; drops (and counts)
    /// the job if the queue is full rather than waiting.
    pub fn enqueue(&self, job: CallbackJob) {
        match self.tx.try_send(job) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(target: "fort.callback", "callback queue full, dropping job");
            }
        }
    }

    /// Snapshot current dispatch statistics.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Build the set of [`CallbackJob`]s for a dispatch round: the union
/// of changed and revoked keys, skipping any key with no need-id
/// component (there is no canonical inbound callback path for it).
///
/// `lookup_response` resolves a changed key's current response; it is
/// not called for revoked keys, which always dispatch `{}`.
pub fn build_jobs<F>(
    capability: &str,
    changed: &[String],
    revoked: &[String],
    mut lookup_response: F,
) -> Vec<CallbackJob>
where
    F: FnMut(&str) -> Option<serde_json::Value>,
{
    let mut jobs = Vec::with_capacity(changed.len() + revoked.len());
    for key in changed {
        let Some((host, need_id)) = split_need_key(key) else {
            continue;
        };
        let Some(need_name) = strip_capability_prefix(capability, need_id) else {
            continue;
        };
        let body = lookup_response(key).unwrap_or(serde_json::Value::Null);
        jobs.push(CallbackJob {
            host: host.to_string(),
            capability: capability.to_string(),
            need_name: need_name.to_string(),
            body,
        });
    }
    for key in revoked {
        let Some((host, need_id)) = split_need_key(key) else {
            continue;
        };
        let Some(need_name) = strip_capability_prefix(capability, need_id) else {
            continue;
        };
        jobs.push(CallbackJob {
            host: host.to_string(),
            capability: capability.to_string(),
            need_name: need_name.to_string(),
            body: serde_json::json!({}),
        });
    }
    jobs
}

fn split_need_key(key: &str) -> Option<(&str, &str)> {
    let (origin, need_id) = fort_core::split_state_key(key);
    need_id.map(|id| (origin, id))
}

fn strip_capability_prefix<'a>(capability: &str, need_id: &'a str) -> Option<&'a str> {
    need_id.strip_prefix(capability)?.strip_prefix('-')
}

/// Resolve the configured signing-client executable, falling back to
/// [`Path::new`]'s bare name so `PATH` resolution is left to the OS
/// exec call, matching how `fort-sign` leaves `ssh-keygen` unresolved.
#[must_use]
pub fn resolve_signing_client(path: &Path) -> SigningClient {
    SigningClient::new(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_job_path_shape() {
        let job = CallbackJob {
            host: "joker".into(),
            capability: "oidc-register".into(),
            need_name: "outline".into(),
            body: serde_json::json!({}),
        };
        assert_eq!(job.path(), "/fort/needs/oidc-register/outline");
    }

    #[test]
    fn build_jobs_skips_keys_without_need_id() {
        let changed = vec!["joker".to_string(), "joker:oidc-register-outline".to_string()];
        let jobs = build_jobs("oidc-register", &changed, &[], |_| {
            Some(serde_json::json!({"client_id": "A"}))
        });
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].host, "joker");
        assert_eq!(jobs[0].need_name, "outline");
        assert_eq!(jobs[0].body, serde_json::json!({"client_id": "A"}));
    }

    #[test]
    fn revoked_keys_dispatch_empty_object() {
        let revoked = vec!["minos:forgejo-token-minos".to_string()];
        let jobs = build_jobs("forgejo-token", &[], &revoked, |_| None);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].body, serde_json::json!({}));
        assert_eq!(jobs[0].path(), "/fort/needs/forgejo-token/minos");
    }

    #[tokio::test]
    async fn dispatcher_drops_when_queue_full() {
        // A signing client pointed at a guaranteed-missing executable
        // so jobs queue up without being drained promptly; capacity 1
        // forces the second enqueue to overflow.
        let client = SigningClient::new(PathBuf::from("/nonexistent/fort-client-test-binary"));
        let dispatcher = CallbackDispatcher::spawn_with_capacity(client, 1);
        dispatcher.enqueue(CallbackJob {
            host: "a".into(),
            capability: "tokens".into(),
            need_name: "x".into(),
            body: serde_json::json!({}),
        });
        dispatcher.enqueue(CallbackJob {
            host: "b".into(),
            capability: "tokens".into(),
            need_name: "y".into(),
            body: serde_json::json!({}),
        });
        dispatcher.enqueue(CallbackJob {
            host: "c".into(),
            capability: "tokens".into(),
            need_name: "z".into(),
            body: serde_json::json!({}),
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let stats = dispatcher.stats();
        assert!(stats.dropped >= 1, "expected at least one dropped job, got {stats:?}");
    }

    #[tokio::test]
    async fn get_needs_rejects_non_success_status() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("client.sh");
        std::fs::write(&script, "#!/bin/sh\necho '{\"body\": \"{}\", \"status\": 503}'\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let client = SigningClient::new(script);
        let err = client.get_needs("joker").await.unwrap_err();
        assert!(matches!(err, SigningClientError::BadResponse(_)));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn get_needs_parses_body_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("client.sh");
        std::fs::write(
            &script,
            r#"#!/bin/sh
echo '{"body": "{\"needs\": [\"tokens/ci\"]}", "status": 200}'
"#,
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let client = SigningClient::new(script);
        let needs = client.get_needs("joker").await.unwrap();
        assert_eq!(needs, vec!["tokens/ci".to_string()]);
    }
}
