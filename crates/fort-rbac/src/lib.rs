// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use fort_core::{NeedConfig, RbacTable};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The result of an allow/deny check, with an optional human-readable
/// reason for denial (surfaced in `FortError` messages upstream).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Decision {
    /// Whether the action is permitted.
    pub allowed: bool,
    /// Why it was denied, if it was.
    pub reason: Option<String>,
}

impl Decision {
    /// An allowing decision.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    /// A denying decision with a reason.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// RBAC checks over the broker's capability allow-list and need
/// ownership table.
#[derive(Debug, Clone)]
pub struct RbacEngine {
    table: RbacTable,
}

impl RbacEngine {
    /// Build an engine over a loaded `rbac.json` table.
    #[must_use]
    pub fn new(table: RbacTable) -> Self {
        Self { table }
    }

    /// Whether `origin` may invoke `capability`. A capability absent
    /// from the table has no origins allowed, and is denied with the
    /// same `forbidden` taxonomy code as an unlisted origin — admission
    /// step 5 treats "no RBAC entry" and "origin not listed" as one
    /// check, per the broker's error-kind mapping (§7).
    #[must_use]
    pub fn can_invoke(&self, capability: &str, origin: &str) -> Decision {
        match self.table.get(capability) {
            Some(allowed) if allowed.iter().any(|o| o == origin) => Decision::allow(),
            Some(_) => Decision::deny(format!(
                "origin '{origin}' is not permitted to invoke '{capability}'"
            )),
            None => Decision::deny(format!("capability '{capability}' has no RBAC entry")),
        }
    }

    /// Whether `origin` is the declared owner of `need` and may
    /// satisfy it via callback.
    #[must_use]
    pub fn can_satisfy_need(need: &NeedConfig, origin: &str) -> Decision {
        if need.from == origin {
            Decision::allow()
        } else {
            Decision::deny(format!(
                "need '{}' can only be satisfied by '{}', not '{origin}'",
                need.id, need.from
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn table() -> RbacTable {
        let mut t = BTreeMap::new();
        t.insert("tokens".to_string(), vec!["builder".to_string()]);
        t
    }

    #[test]
    fn allowed_origin_can_invoke() {
        let engine = RbacEngine::new(table());
        assert!(engine.can_invoke("tokens", "builder").allowed);
    }

    #[test]
    fn unlisted_origin_is_denied() {
        let engine = RbacEngine::new(table());
        let decision = engine.can_invoke("tokens", "intruder");
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("intruder"));
    }

    #[test]
    fn unknown_capability_is_denied() {
        let engine = RbacEngine::new(table());
        let decision = engine.can_invoke("ghost", "builder");
        assert!(!decision.allowed);
    }

    #[test]
    fn need_ownership_check() {
        let need = NeedConfig {
            id: "tokens-ci".into(),
            capability: "tokens".into(),
            from: "builder".into(),
            request: serde_json::Value::Null,
            handler: None,
            nag_seconds: 0,
        };
        assert!(RbacEngine::can_satisfy_need(&need, "builder").allowed);
        assert!(!RbacEngine::can_satisfy_need(&need, "intruder").allowed);
    }
}
