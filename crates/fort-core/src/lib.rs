// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Default SSH signature namespace used for all broker admission checks
/// and outbound callbacks.
pub const SIGNATURE_NAMESPACE: &str = "fort-agent";

/// Maximum allowed clock skew between a request's `X-Fort-Timestamp`
/// header and the server clock.
pub const MAX_TIMESTAMP_DRIFT_SECS: i64 = 5 * 60;

/// A host known to the broker, keyed by hostname in [`HostTable`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HostEntry {
    /// The host's SSH public key, in `authorized_keys` line format
    /// (`<algo> <base64> [comment]`).
    pub pubkey: String,
}

/// `hostname -> HostEntry`, loaded once from `hosts.json` and immutable
/// for the process lifetime.
pub type HostTable = BTreeMap<String, HostEntry>;

/// `capability -> allowed origin hostnames`, loaded from `rbac.json`.
/// A capability absent from this table has no origins allowed.
pub type RbacTable = BTreeMap<String, Vec<String>>;

/// Execution mode of a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityMode {
    /// Single request, single response; no state touched.
    Rpc,
    /// Request updates shared per-capability state; worker sees the
    /// whole view; responses propagate via callbacks.
    Async,
}

/// Sweep triggers a capability participates in.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Triggers {
    /// Re-dispatch this capability's full state once on broker start.
    #[serde(default)]
    pub initialize: bool,
    /// systemd unit names that, when they notify readiness, should
    /// cause a `--trigger <capability>` sweep (interpreted by the
    /// supervising service manager, not by the broker itself).
    #[serde(default)]
    pub systemd: Vec<String>,
}

/// Configuration for one capability, keyed by name in
/// `capabilities.json`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CapabilityConfig {
    /// RPC or async. `needs_gc: true` forces async regardless of this
    /// field — see [`CapabilityConfig::effective_mode`].
    #[serde(default = "default_mode")]
    pub mode: CapabilityMode,
    /// Whether this capability's responses are content-addressed and
    /// exposed through the handle store.
    #[serde(default)]
    pub needs_gc: bool,
    /// Handle TTL in seconds. `0` means no expiry.
    #[serde(default)]
    pub ttl: u64,
    /// Whether a byte-identical response should be treated as a cache
    /// hit (suppressing a callback dispatch).
    #[serde(default = "default_true")]
    pub cache_response: bool,
    /// Worker async output shape.
    #[serde(default)]
    pub format: AsyncFormat,
    /// Sweep participation.
    #[serde(default)]
    pub triggers: Triggers,
}

fn default_mode() -> CapabilityMode {
    CapabilityMode::Rpc
}

fn default_true() -> bool {
    true
}

impl CapabilityConfig {
    /// `needs_gc` forces async mode even if `mode` says otherwise.
    #[must_use]
    pub fn effective_mode(&self) -> CapabilityMode {
        if self.needs_gc {
            CapabilityMode::Async
        } else {
            self.mode
        }
    }
}

/// Worker async output wire shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AsyncFormat {
    /// `{ key: response }`.
    #[default]
    Legacy,
    /// `{ key: { request, response } }`.
    Symmetric,
}

/// `capability -> CapabilityConfig`, loaded from `capabilities.json`.
pub type CapabilityTable = BTreeMap<String, CapabilityConfig>;

/// A declared need, identified by `<capability>-<name>`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NeedConfig {
    /// Need identifier, of the form `<capability>-<name>`.
    pub id: String,
    /// Capability this need is satisfied through.
    pub capability: String,
    /// The one origin permitted to satisfy this need via callback.
    pub from: String,
    /// Arbitrary request payload handed to the satisfaction handler.
    #[serde(default)]
    pub request: serde_json::Value,
    /// Optional absolute path to a satisfaction handler; see
    /// [`NeedConfig::name`] for how the callback path is derived.
    #[serde(default)]
    pub handler: Option<String>,
    /// Seconds between consumer-side re-polls. Not touched by the
    /// broker; reserved for the consumer.
    #[serde(default)]
    pub nag_seconds: u64,
}

impl NeedConfig {
    /// The `<name>` portion of `id`, i.e. `id` with the
    /// `<capability>-` prefix stripped. Used to build the inbound
    /// callback path `/fort/needs/<capability>/<name>`.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.id
            .strip_prefix(&self.capability)
            .and_then(|rest| rest.strip_prefix('-'))
    }
}

/// Needs, loaded from `needs.json`, keyed by `id` for lookup.
pub type NeedTable = BTreeMap<String, NeedConfig>;

/// Build a [`NeedTable`] from a flat list, as read from `needs.json`.
#[must_use]
pub fn index_needs(needs: Vec<NeedConfig>) -> NeedTable {
    needs.into_iter().map(|n| (n.id.clone(), n)).collect()
}

/// One entry in a capability's provider state: the last request seen
/// for this key, and the worker's last non-error response.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProviderStateEntry {
    /// The request body most recently associated with this key.
    pub request: serde_json::Value,
    /// The worker's last non-error response for this key, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    /// Unix seconds this entry was last updated.
    pub updated_at: i64,
}

/// `capability -> (provider-state key -> entry)`.
pub type ProviderState = BTreeMap<String, BTreeMap<String, ProviderStateEntry>>;

/// One entry in the fulfillment-state table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
pub struct FulfillmentStateEntry {
    /// Whether the need is currently satisfied.
    pub satisfied: bool,
    /// Reserved for the consumer-side poller; the broker never writes
    /// a value here other than preserving it across updates.
    #[serde(default)]
    pub last_sought: i64,
}

/// `need-id -> FulfillmentStateEntry`.
pub type FulfillmentState = BTreeMap<String, FulfillmentStateEntry>;

/// A content-addressed handle metadata record, persisted as the
/// `.meta` sibling of a handle blob when `ttl > 0`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
pub struct HandleMeta {
    /// Unix seconds at which the handle should be considered expired.
    pub expiry: i64,
    /// The TTL, in seconds, that produced `expiry`.
    pub ttl: u64,
}

/// Compute the provider-state key for a request: `origin` alone, or
/// `origin:<need_id>` when the request carries `_fort_need_id`.
#[must_use]
pub fn state_key(origin: &str, need_id: Option<&str>) -> String {
    match need_id {
        Some(id) => format!("{origin}:{id}"),
        None => origin.to_string(),
    }
}

/// Extract `_fort_need_id` from a request body, if present and a
/// string.
#[must_use]
pub fn need_id_from_body(body: &serde_json::Value) -> Option<&str> {
    body.get("_fort_need_id").and_then(|v| v.as_str())
}

/// Split a provider-state key back into `(origin, need_id)`.
#[must_use]
pub fn split_state_key(key: &str) -> (&str, Option<&str>) {
    match key.split_once(':') {
        Some((origin, need_id)) => (origin, Some(need_id)),
        None => (key, None),
    }
}

/// Compute the content-addressed handle name for a response body:
/// `sha256:<hex>`.
#[must_use]
pub fn compute_handle(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    format!("sha256:{digest:x}")
}

/// Map a handle name to its on-disk filename: `:` becomes `-`.
///
/// `sha256:abcd...` -> `sha256-abcd...`.
#[must_use]
pub fn handle_filename(handle: &str) -> String {
    handle.replace(':', "-")
}

/// `true` if a worker response carries a top-level `error` field,
/// which per the data-model invariants must never be cached into
/// provider state.
#[must_use]
pub fn is_error_response(response: &serde_json::Value) -> bool {
    response.get("error").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_key_without_need_id_is_bare_origin() {
        assert_eq!(state_key("alpha", None), "alpha");
    }

    #[test]
    fn state_key_with_need_id_joins_with_colon() {
        assert_eq!(state_key("alpha", Some("tokens-ci")), "alpha:tokens-ci");
    }

    #[test]
    fn split_state_key_round_trips() {
        assert_eq!(split_state_key("alpha:tokens-ci"), ("alpha", Some("tokens-ci")));
        assert_eq!(split_state_key("alpha"), ("alpha", None));
    }

    #[test]
    fn need_id_from_body_reads_string_field() {
        let body = serde_json::json!({"_fort_need_id": "tokens-ci", "x": 1});
        assert_eq!(need_id_from_body(&body), Some("tokens-ci"));
        assert_eq!(need_id_from_body(&serde_json::json!({})), None);
    }

    #[test]
    fn compute_handle_is_sha256_with_prefix() {
        let handle = compute_handle(b"hello");
        assert!(handle.starts_with("sha256:"));
        assert_eq!(handle.len(), "sha256:".len() + 64);
        // Stable across calls.
        assert_eq!(handle, compute_handle(b"hello"));
        assert_ne!(handle, compute_handle(b"hellp"));
    }

    #[test]
    fn handle_filename_replaces_colon() {
        assert_eq!(
            handle_filename("sha256:deadbeef"),
            "sha256-deadbeef"
        );
    }

    #[test]
    fn needs_gc_forces_async_mode() {
        let cfg = CapabilityConfig {
            mode: CapabilityMode::Rpc,
            needs_gc: true,
            ttl: 0,
            cache_response: true,
            format: AsyncFormat::Legacy,
            triggers: Triggers::default(),
        };
        assert_eq!(cfg.effective_mode(), CapabilityMode::Async);
    }

    #[test]
    fn need_name_strips_capability_prefix() {
        let need = NeedConfig {
            id: "tokens-ci".into(),
            capability: "tokens".into(),
            from: "builder".into(),
            request: serde_json::Value::Null,
            handler: None,
            nag_seconds: 0,
        };
        assert_eq!(need.name(), Some("ci"));
    }

    #[test]
    fn is_error_response_detects_error_field() {
        assert!(is_error_response(&serde_json::json!({"error": "boom"})));
        assert!(!is_error_response(&serde_json::json!({"ok": true})));
    }

    #[test]
    fn index_needs_keys_by_id() {
        let needs = vec![NeedConfig {
            id: "tokens-ci".into(),
            capability: "tokens".into(),
            from: "builder".into(),
            request: serde_json::Value::Null,
            handler: None,
            nag_seconds: 0,
        }];
        let table = index_needs(needs);
        assert!(table.contains_key("tokens-ci"));
    }
}
