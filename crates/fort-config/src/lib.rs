// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use fort_core::{CapabilityTable, HostTable, NeedConfig, RbacTable, index_needs};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default configuration directory, matching the original deployment's
/// `/etc/fort`.
pub const DEFAULT_CONFIG_DIR: &str = "/etc/fort";

/// Default state directory, matching the original deployment's
/// `/var/lib/fort`.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/fort";

/// Default GC sweep interval in seconds, used only to size the
/// rotation window (`2 * interval`) in `--gc`.
pub const DEFAULT_GC_INTERVAL_SECS: u64 = 3600;

/// Default signing-client executable name, resolved on `PATH` unless
/// overridden.
pub const DEFAULT_SIGNING_CLIENT: &str = "fort-client";

/// Errors from loading or validating broker configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required document could not be found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// A document's contents were not valid JSON, or did not match
    /// the expected shape.
    #[error("failed to parse {path}: {reason}")]
    ParseError {
        /// Path of the offending document.
        path: String,
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed.
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// The broker's own runtime settings, distinct from the four domain
/// documents. Loaded from CLI flags (see `fort-daemon`), with
/// environment variable overrides applied on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Directory containing `hosts.json`, `rbac.json`,
    /// `capabilities.json`, `needs.json`, and `handlers/`.
    pub config_dir: PathBuf,
    /// Directory containing `provider-state.json`,
    /// `fulfillment-state.json`, and `handles/`.
    pub state_dir: PathBuf,
    /// Path to the local signing-client executable, used for outbound
    /// callbacks and GC's `GET /fort/needs` polling.
    pub signing_client_path: PathBuf,
    /// GC interval in seconds; only used to size the rotation window.
    pub gc_interval_secs: u64,
    /// Widen the tracing filter to `fort=debug`.
    pub debug: bool,
}

impl BrokerConfig {
    /// Build a config rooted at the given config/state directories
    /// with otherwise-default settings.
    #[must_use]
    pub fn new(config_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            state_dir: state_dir.into(),
            signing_client_path: PathBuf::from(DEFAULT_SIGNING_CLIENT),
            gc_interval_secs: DEFAULT_GC_INTERVAL_SECS,
            debug: false,
        }
    }

    /// Directory containing worker executables, one per capability.
    #[must_use]
    pub fn handlers_dir(&self) -> PathBuf {
        self.config_dir.join("handlers")
    }

    /// Directory containing content-addressed handle blobs.
    #[must_use]
    pub fn handles_dir(&self) -> PathBuf {
        self.state_dir.join("handles")
    }

    /// Path to the persisted provider-state document.
    #[must_use]
    pub fn provider_state_path(&self) -> PathBuf {
        self.state_dir.join("provider-state.json")
    }

    /// Path to the persisted fulfillment-state document.
    #[must_use]
    pub fn fulfillment_state_path(&self) -> PathBuf {
        self.state_dir.join("fulfillment-state.json")
    }

    /// Path to the worker executable for a capability, if it exists.
    /// Does not itself check existence — callers performing admission
    /// checks should stat this path.
    #[must_use]
    pub fn handler_path(&self, capability: &str) -> PathBuf {
        self.handlers_dir().join(capability)
    }

    /// Seconds within which a `ttl > 0` handle is considered "near
    /// expiry" during a GC sweep: `2 * gc_interval_secs`.
    #[must_use]
    pub fn rotation_window_secs(&self) -> u64 {
        self.gc_interval_secs.saturating_mul(2)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_DIR, DEFAULT_STATE_DIR)
    }
}

/// The fully loaded, immutable domain configuration: hosts, RBAC,
/// capabilities, and needs.
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// Known hosts and their public keys.
    pub hosts: HostTable,
    /// Capability -> allowed origins.
    pub rbac: RbacTable,
    /// Capability -> its configuration.
    pub capabilities: CapabilityTable,
    /// Declared needs, keyed by need-id.
    pub needs: std::collections::BTreeMap<String, NeedConfig>,
}

/// Load the four domain documents from `config_dir`.
///
/// `hosts.json` is required; the other three are optional and default
/// to empty tables when absent, matching the original deployment's
/// tolerance for a broker with no async capabilities configured yet.
///
/// # Errors
///
/// Returns [`ConfigError::FileNotFound`] if `hosts.json` is missing,
/// or [`ConfigError::ParseError`] if any present document fails to
/// parse.
pub fn load_domain_config(config_dir: &Path) -> Result<DomainConfig, ConfigError> {
    let hosts = load_required_json(&config_dir.join("hosts.json"))?;
    let rbac = load_optional_json(&config_dir.join("rbac.json"))?.unwrap_or_default();
    let capabilities =
        load_optional_json(&config_dir.join("capabilities.json"))?.unwrap_or_default();
    let needs: Vec<NeedConfig> =
        load_optional_json(&config_dir.join("needs.json"))?.unwrap_or_default();

    Ok(DomainConfig {
        hosts,
        rbac,
        capabilities,
        needs: index_needs(needs),
    })
}

fn load_required_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.display().to_string(),
    })?;
    serde_json::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn load_optional_json<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let value = serde_json::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ConfigError::ParseError {
            path: path.display().to_string(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_hosts_json_is_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_domain_config(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn optional_documents_default_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("hosts.json"),
            r#"{"alpha": {"pubkey": "ssh-ed25519 AAAA alpha"}}"#,
        )
        .unwrap();

        let cfg = load_domain_config(dir.path()).unwrap();
        assert_eq!(cfg.hosts.len(), 1);
        assert!(cfg.rbac.is_empty());
        assert!(cfg.capabilities.is_empty());
        assert!(cfg.needs.is_empty());
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hosts.json"), "not json").unwrap();
        let err = load_domain_config(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn full_config_loads() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("hosts.json"),
            r#"{"alpha": {"pubkey": "k"}}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("rbac.json"),
            r#"{"tokens": ["alpha"]}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("capabilities.json"),
            r#"{"tokens": {"mode": "async", "needs_gc": true, "ttl": 3600}}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("needs.json"),
            r#"[{"id": "tokens-ci", "capability": "tokens", "from": "builder"}]"#,
        )
        .unwrap();

        let cfg = load_domain_config(dir.path()).unwrap();
        assert_eq!(cfg.rbac.get("tokens").unwrap(), &vec!["alpha".to_string()]);
        assert!(cfg.capabilities.get("tokens").unwrap().needs_gc);
        assert!(cfg.needs.contains_key("tokens-ci"));
    }

    #[test]
    fn broker_config_paths() {
        let cfg = BrokerConfig::new("/etc/fort", "/var/lib/fort");
        assert_eq!(cfg.handlers_dir(), PathBuf::from("/etc/fort/handlers"));
        assert_eq!(cfg.handles_dir(), PathBuf::from("/var/lib/fort/handles"));
        assert_eq!(
            cfg.provider_state_path(),
            PathBuf::from("/var/lib/fort/provider-state.json")
        );
        assert_eq!(cfg.rotation_window_secs(), DEFAULT_GC_INTERVAL_SECS * 2);
    }
}
