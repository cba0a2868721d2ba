//! Provider-state store: the broker's per-capability, per-key record
//! of the last request and last successful worker response.

use crate::atomic::{read_json_or_default, write_json_atomically};
use fort_core::{ProviderState, ProviderStateEntry, is_error_response, split_state_key};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors from reading or writing the provider-state document.
#[derive(Debug, Error)]
pub enum ProviderStateError {
    /// The document could not be read or parsed.
    #[error("failed to read provider state: {0}")]
    Read(#[source] std::io::Error),
    /// The document could not be written.
    #[error("failed to write provider state: {0}")]
    Write(#[source] std::io::Error),
}

/// The outcome of applying a worker's output to a capability's state:
/// which keys changed response, and which were revoked (previously
/// had a response, now absent from the worker's output entirely).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Keys whose response differs from what it was before this
    /// invocation (including keys that previously had no response).
    pub changed: Vec<String>,
    /// Keys the worker dropped from its output despite a prior
    /// non-empty response. Dispatched with an empty-object callback
    /// payload; the entry's `response` is cleared so a repeated
    /// identical trigger does not keep re-detecting the same
    /// revocation (the entry itself still stands until GC's
    /// positive-absence reclaim removes it entirely).
    pub revoked: Vec<String>,
}

/// Single-writer, atomically-persisted provider-state store.
pub struct ProviderStateStore {
    path: PathBuf,
    inner: Mutex<ProviderState>,
}

impl ProviderStateStore {
    /// Load the store from `path`, or start empty if the file does
    /// not exist yet.
    pub async fn load(path: PathBuf) -> Result<Self, ProviderStateError> {
        let state: ProviderState =
            read_json_or_default(&path).map_err(ProviderStateError::Read)?;
        Ok(Self {
            path,
            inner: Mutex::new(state),
        })
    }

    /// Snapshot every entry currently recorded for `capability`. Used
    /// to build the worker's input envelope and to diff against the
    /// worker's output.
    pub async fn snapshot_capability(
        &self,
        capability: &str,
    ) -> BTreeMap<String, ProviderStateEntry> {
        let state = self.inner.lock().await;
        state.get(capability).cloned().unwrap_or_default()
    }

    /// Record an inbound request against `key`, preserving any
    /// existing response. This is step 2 of the async capability
    /// path: the triggering request always updates its own entry
    /// before the worker is invoked.
    pub async fn upsert_request(
        &self,
        capability: &str,
        key: &str,
        request: serde_json::Value,
        now: i64,
    ) -> Result<(), ProviderStateError> {
        let mut state = self.inner.lock().await;
        let entries = state.entry(capability.to_string()).or_default();
        entries
            .entry(key.to_string())
            .and_modify(|e| {
                e.request = request.clone();
                e.updated_at = now;
            })
            .or_insert(ProviderStateEntry {
                request,
                response: None,
                updated_at: now,
            });
        self.persist(&state)
    }

    /// Apply a worker's normalized output (`key -> response`, already
    /// stripped of the legacy/symmetric wire shape by `fort-worker`)
    /// to a capability's state.
    ///
    /// Error-bearing responses (an object carrying an `error` field)
    /// are never cached and never counted as changed — they are
    /// returned to the caller of the triggering request but otherwise
    /// dropped, per the broker's data-model invariants.
    pub async fn apply_responses(
        &self,
        capability: &str,
        responses: &BTreeMap<String, serde_json::Value>,
        now: i64,
    ) -> Result<ApplyOutcome, ProviderStateError> {
        let mut state = self.inner.lock().await;
        let prior = state.get(capability).cloned().unwrap_or_default();

        let mut outcome = ApplyOutcome::default();
        let entries = state.entry(capability.to_string()).or_default();

        for (key, response) in responses {
            if is_error_response(response) {
                continue;
            }
            let prior_response = prior.get(key).and_then(|e| e.response.as_ref());
            if prior_response != Some(response) {
                outcome.changed.push(key.clone());
            }
            entries
                .entry(key.clone())
                .and_modify(|e| {
                    e.response = Some(response.clone());
                    e.updated_at = now;
                })
                .or_insert(ProviderStateEntry {
                    request: serde_json::Value::Null,
                    response: Some(response.clone()),
                    updated_at: now,
                });
        }

        for (key, entry) in &prior {
            if entry.response.is_some() && !responses.contains_key(key) {
                outcome.revoked.push(key.clone());
            }
        }
        for key in &outcome.revoked {
            if let Some(entry) = entries.get_mut(key) {
                entry.response = None;
                entry.updated_at = now;
            }
        }

        self.persist(&state)?;
        Ok(outcome)
    }

    /// Remove a set of keys from a capability's state (GC positive-
    /// absence reclaim). Returns `true` if anything was removed.
    pub async fn remove_keys(
        &self,
        capability: &str,
        keys: &[String],
    ) -> Result<bool, ProviderStateError> {
        let mut state = self.inner.lock().await;
        let mut removed_any = false;
        if let Some(entries) = state.get_mut(capability) {
            for key in keys {
                if entries.remove(key).is_some() {
                    removed_any = true;
                }
            }
        }
        if removed_any {
            self.persist(&state)?;
        }
        Ok(removed_any)
    }

    /// Distinct origins with at least one state entry under
    /// `capability`, derived from each key's `origin[:need-id]` shape.
    pub async fn distinct_origins(&self, capability: &str) -> Vec<String> {
        let state = self.inner.lock().await;
        let Some(entries) = state.get(capability) else {
            return Vec::new();
        };
        let mut origins: Vec<String> = entries
            .keys()
            .map(|k| split_state_key(k).0.to_string())
            .collect();
        origins.sort();
        origins.dedup();
        origins
    }

    /// Every `(capability, name)` pair currently recorded for `origin`
    /// under `capability`, derived from keys of the shape
    /// `origin:<capability>-<name>`. Keys with no need-id component
    /// are skipped — they have no declared-need counterpart to check
    /// against.
    pub async fn declared_pairs_for_origin(
        &self,
        capability: &str,
        origin: &str,
    ) -> Vec<String> {
        let state = self.inner.lock().await;
        let Some(entries) = state.get(capability) else {
            return Vec::new();
        };
        entries
            .keys()
            .filter_map(|k| {
                let (key_origin, need_id) = split_state_key(k);
                if key_origin == origin { need_id.map(str::to_string) } else { None }
            })
            .collect()
    }

    /// List every capability with any recorded state, for sweeps that
    /// iterate "every async/needs_gc capability with state".
    pub async fn capabilities(&self) -> Vec<String> {
        let state = self.inner.lock().await;
        state.keys().cloned().collect()
    }

    fn persist(&self, state: &ProviderState) -> Result<(), ProviderStateError> {
        write_json_atomically(&self.path, state).map_err(ProviderStateError::Write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(v: serde_json::Value) -> serde_json::Value {
        v
    }

    #[tokio::test]
    async fn upsert_preserves_existing_response() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProviderStateStore::load(dir.path().join("provider-state.json"))
            .await
            .unwrap();

        store
            .upsert_request("tokens", "alpha", body(serde_json::json!({"n": 1})), 100)
            .await
            .unwrap();
        let mut responses = BTreeMap::new();
        responses.insert("alpha".to_string(), serde_json::json!({"token": "abc"}));
        store.apply_responses("tokens", &responses, 101).await.unwrap();

        store
            .upsert_request("tokens", "alpha", body(serde_json::json!({"n": 2})), 200)
            .await
            .unwrap();

        let snap = store.snapshot_capability("tokens").await;
        let entry = snap.get("alpha").unwrap();
        assert_eq!(entry.request, serde_json::json!({"n": 2}));
        assert_eq!(entry.response, Some(serde_json::json!({"token": "abc"})));
        assert_eq!(entry.updated_at, 200);
    }

    #[tokio::test]
    async fn apply_responses_detects_changed_and_skips_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProviderStateStore::load(dir.path().join("provider-state.json"))
            .await
            .unwrap();

        store
            .upsert_request("tokens", "alpha", serde_json::json!({}), 1)
            .await
            .unwrap();
        store
            .upsert_request("tokens", "beta", serde_json::json!({}), 1)
            .await
            .unwrap();

        let mut responses = BTreeMap::new();
        responses.insert("alpha".to_string(), serde_json::json!({"token": "t1"}));
        responses.insert("beta".to_string(), serde_json::json!({"error": "denied"}));

        let outcome = store.apply_responses("tokens", &responses, 2).await.unwrap();
        assert_eq!(outcome.changed, vec!["alpha".to_string()]);
        assert!(outcome.revoked.is_empty());

        let snap = store.snapshot_capability("tokens").await;
        assert_eq!(snap["alpha"].response, Some(serde_json::json!({"token": "t1"})));
        assert_eq!(snap["beta"].response, None);
    }

    #[tokio::test]
    async fn apply_responses_detects_revocation() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProviderStateStore::load(dir.path().join("provider-state.json"))
            .await
            .unwrap();
        store
            .upsert_request("tokens", "alpha", serde_json::json!({}), 1)
            .await
            .unwrap();
        let mut responses = BTreeMap::new();
        responses.insert("alpha".to_string(), serde_json::json!({"token": "t1"}));
        store.apply_responses("tokens", &responses, 2).await.unwrap();

        let outcome = store
            .apply_responses("tokens", &BTreeMap::new(), 3)
            .await
            .unwrap();
        assert_eq!(outcome.revoked, vec!["alpha".to_string()]);
        assert!(outcome.changed.is_empty());

        // The stale response is cleared so a repeated identical trigger
        // does not keep re-detecting the same revocation.
        let snap = store.snapshot_capability("tokens").await;
        assert_eq!(snap["alpha"].response, None);

        let outcome = store
            .apply_responses("tokens", &BTreeMap::new(), 4)
            .await
            .unwrap();
        assert!(outcome.revoked.is_empty(), "revocation must not repeat once cleared");
    }

    #[tokio::test]
    async fn no_op_reapply_produces_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProviderStateStore::load(dir.path().join("provider-state.json"))
            .await
            .unwrap();
        store
            .upsert_request("tokens", "alpha", serde_json::json!({}), 1)
            .await
            .unwrap();
        let mut responses = BTreeMap::new();
        responses.insert("alpha".to_string(), serde_json::json!({"token": "t1"}));
        store.apply_responses("tokens", &responses, 2).await.unwrap();

        let outcome = store.apply_responses("tokens", &responses, 3).await.unwrap();
        assert!(outcome.changed.is_empty());
        assert!(outcome.revoked.is_empty());
    }

    #[tokio::test]
    async fn remove_keys_and_distinct_origins() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProviderStateStore::load(dir.path().join("provider-state.json"))
            .await
            .unwrap();
        store
            .upsert_request("tokens", "alpha:tokens-ci", serde_json::json!({}), 1)
            .await
            .unwrap();
        store
            .upsert_request("tokens", "beta:tokens-ci", serde_json::json!({}), 1)
            .await
            .unwrap();

        assert_eq!(
            store.distinct_origins("tokens").await,
            vec!["alpha".to_string(), "beta".to_string()]
        );
        assert_eq!(
            store.declared_pairs_for_origin("tokens", "alpha").await,
            vec!["tokens-ci".to_string()]
        );

        let removed = store
            .remove_keys("tokens", &["alpha:tokens-ci".to_string()])
            .await
            .unwrap();
        assert!(removed);
        assert_eq!(store.distinct_origins("tokens").await, vec!["beta".to_string()]);
    }

    #[tokio::test]
    async fn persists_and_reloads_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provider-state.json");
        {
            let store = ProviderStateStore::load(path.clone()).await.unwrap();
            store
                .upsert_request("tokens", "alpha", serde_json::json!({"n": 1}), 5)
                .await
                .unwrap();
        }
        let reloaded = ProviderStateStore::load(path).await.unwrap();
        let snap = reloaded.snapshot_capability("tokens").await;
        assert_eq!(snap["alpha"].request, serde_json::json!({"n": 1}));
    }
}
