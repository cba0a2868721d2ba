//! Error taxonomy and HTTP status mapping for the fort capability broker.
//!
//! Every error raised while admitting, authorizing or dispatching a
//! request carries a [`ErrorCode`] (a stable, wire-safe tag), a
//! human-readable message and an optional cause chain. The code's
//! [`ErrorCategory`] determines the [`Kind`] returned to callers, which
//! in turn determines the HTTP status line.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Kind — the wire-facing taxonomy
// ---------------------------------------------------------------------------

/// The broker's HTTP-facing error taxonomy.
///
/// Mirrors the five outcomes a request can resolve to, plus
/// `MethodNotAllowed`, which the broker's core never produces (it is
/// reserved for subordinate services sharing this crate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Kind {
    /// Malformed path, unreadable body, missing headers.
    BadRequest,
    /// Missing/malformed auth headers, stale timestamp, unknown origin,
    /// signature verification failure.
    Unauthenticated,
    /// RBAC denial, or a callback origin that is not the need's `from`.
    Forbidden,
    /// Unknown capability, missing handler, unknown need.
    NotFound,
    /// Reserved for subordinate services; unused by the broker core.
    MethodNotAllowed,
    /// Worker launch failure, state or handle persistence failure.
    Internal,
}

impl Kind {
    /// The HTTP status code this kind maps onto.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthenticated => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::Internal => 500,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BadRequest => "bad-request",
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not-found",
            Self::MethodNotAllowed => "method-not-allowed",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad subsystem an [`ErrorCode`] originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Request admission: headers, timestamp window, signature.
    Admission,
    /// RBAC / need-ownership checks.
    Rbac,
    /// Worker spawn, execution, or malformed output.
    Worker,
    /// Provider-state / fulfillment-state persistence.
    State,
    /// Handle store persistence.
    Handle,
    /// The local signing-client adapter.
    Signing,
    /// Configuration loading and validation.
    Config,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCategory {
    /// The HTTP-facing [`Kind`] this category resolves to.
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Self::Admission => Kind::Unauthenticated,
            Self::Rbac => Kind::Forbidden,
            Self::Worker => Kind::Internal,
            Self::State => Kind::Internal,
            Self::Handle => Kind::Internal,
            Self::Signing => Kind::Internal,
            Self::Config => Kind::Internal,
            Self::Internal => Kind::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Admission => "admission",
            Self::Rbac => "rbac",
            Self::Worker => "worker",
            Self::State => "state",
            Self::Handle => "handle",
            Self::Signing => "signing",
            Self::Config => "config",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Serialises to `SCREAMING_SNAKE_CASE`. Not part of the broker's wire
/// response body (which stays `{"error": "<message>"}` for backward
/// compatibility) but carried through logs and available to callers
/// that construct a [`FortError`] directly (tests, the CLI sweep
/// paths).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Admission --
    /// One or more of the three auth headers is missing or unparsable.
    AdmissionMissingHeaders,
    /// Request body could not be read.
    AdmissionBodyUnreadable,
    /// Timestamp is outside the replay window.
    AdmissionStaleTimestamp,
    /// Origin is not present in the host table.
    AdmissionUnknownOrigin,
    /// Signature verification failed.
    AdmissionBadSignature,
    /// Path did not match any known route.
    AdmissionUnknownRoute,
    /// A callback path referenced a need-id absent from the need
    /// registry.
    AdmissionUnknownNeed,

    // -- Rbac --
    /// Capability exists but origin is not in its allow-list.
    RbacOriginNotAllowed,
    /// Callback origin does not match the need's declared `from`.
    RbacWrongNeedOwner,

    // -- Worker --
    /// No worker executable exists for the capability.
    WorkerNotFound,
    /// The worker process could not be spawned.
    WorkerSpawnFailed,
    /// The worker exited non-zero.
    WorkerNonZeroExit,
    /// The worker's stdout could not be parsed into the expected shape.
    WorkerMalformedOutput,

    // -- State --
    /// Provider-state or fulfillment-state file could not be read.
    StateReadFailed,
    /// Provider-state or fulfillment-state file could not be written.
    StateWriteFailed,
    /// Persisted state failed to parse as valid JSON.
    StateCorrupt,

    // -- Handle --
    /// A handle blob or its `.meta` sibling could not be persisted.
    HandlePersistFailed,

    // -- Signing --
    /// The signing-client executable could not be spawned.
    SigningClientUnavailable,
    /// The signing-client envelope was malformed or reported failure.
    SigningClientFailed,

    // -- Config --
    /// A required configuration document is missing.
    ConfigMissing,
    /// A configuration document failed to parse.
    ConfigInvalid,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// The [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::AdmissionMissingHeaders
            | Self::AdmissionBodyUnreadable
            | Self::AdmissionStaleTimestamp
            | Self::AdmissionUnknownOrigin
            | Self::AdmissionBadSignature
            | Self::AdmissionUnknownRoute
            | Self::AdmissionUnknownNeed => ErrorCategory::Admission,

            Self::RbacOriginNotAllowed | Self::RbacWrongNeedOwner => ErrorCategory::Rbac,

            Self::WorkerNotFound
            | Self::WorkerSpawnFailed
            | Self::WorkerNonZeroExit
            | Self::WorkerMalformedOutput => ErrorCategory::Worker,

            Self::StateReadFailed | Self::StateWriteFailed | Self::StateCorrupt => {
                ErrorCategory::State
            }

            Self::HandlePersistFailed => ErrorCategory::Handle,

            Self::SigningClientUnavailable | Self::SigningClientFailed => ErrorCategory::Signing,

            Self::ConfigMissing | Self::ConfigInvalid => ErrorCategory::Config,

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Shorthand for `self.category().kind()`.
    #[must_use]
    pub fn kind(&self) -> Kind {
        // A handful of admission codes read differently from the rest
        // of their category: an unknown route or missing handler is
        // "not found" even though Admission/Worker otherwise resolve
        // to Unauthenticated/Internal, and an unreadable body is a
        // client-side malformation rather than an auth failure.
        match self {
            Self::AdmissionUnknownRoute | Self::AdmissionUnknownNeed | Self::WorkerNotFound => {
                Kind::NotFound
            }
            Self::AdmissionBodyUnreadable => Kind::BadRequest,
            other => other.category().kind(),
        }
    }

    /// Stable `&'static str` representation, e.g. `"ADMISSION_BAD_SIGNATURE"`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdmissionMissingHeaders => "ADMISSION_MISSING_HEADERS",
            Self::AdmissionBodyUnreadable => "ADMISSION_BODY_UNREADABLE",
            Self::AdmissionStaleTimestamp => "ADMISSION_STALE_TIMESTAMP",
            Self::AdmissionUnknownOrigin => "ADMISSION_UNKNOWN_ORIGIN",
            Self::AdmissionBadSignature => "ADMISSION_BAD_SIGNATURE",
            Self::AdmissionUnknownRoute => "ADMISSION_UNKNOWN_ROUTE",
            Self::AdmissionUnknownNeed => "ADMISSION_UNKNOWN_NEED",
            Self::RbacOriginNotAllowed => "RBAC_ORIGIN_NOT_ALLOWED",
            Self::RbacWrongNeedOwner => "RBAC_WRONG_NEED_OWNER",
            Self::WorkerNotFound => "WORKER_NOT_FOUND",
            Self::WorkerSpawnFailed => "WORKER_SPAWN_FAILED",
            Self::WorkerNonZeroExit => "WORKER_NON_ZERO_EXIT",
            Self::WorkerMalformedOutput => "WORKER_MALFORMED_OUTPUT",
            Self::StateReadFailed => "STATE_READ_FAILED",
            Self::StateWriteFailed => "STATE_WRITE_FAILED",
            Self::StateCorrupt => "STATE_CORRUPT",
            Self::HandlePersistFailed => "HANDLE_PERSIST_FAILED",
            Self::SigningClientUnavailable => "SIGNING_CLIENT_UNAVAILABLE",
            Self::SigningClientFailed => "SIGNING_CLIENT_FAILED",
            Self::ConfigMissing => "CONFIG_MISSING",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// FortError
// ---------------------------------------------------------------------------

/// Unified broker error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an
/// optional source error, and arbitrary structured context for logs.
pub struct FortError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description. This is what the wire response body
    /// carries under `"error"`.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl FortError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.kind()`.
    #[must_use]
    pub fn kind(&self) -> Kind {
        self.code.kind()
    }

    /// The JSON body the broker writes to the wire: `{"error": message}`.
    #[must_use]
    pub fn wire_body(&self) -> serde_json::Value {
        serde_json::json!({ "error": self.message })
    }
}

impl fmt::Debug for FortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("FortError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for FortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for FortError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Construct a [`FortError`] tersely: `fort_err!(Kind::Forbidden, ...)`
/// isn't needed since `Kind` is derived; this macro is for the common
/// `fort_err!(ErrorCode::X, "message {}", arg)` shape.
#[macro_export]
macro_rules! fort_err {
    ($code:expr, $($arg:tt)*) => {
        $crate::FortError::new($code, format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_status_codes() {
        assert_eq!(Kind::BadRequest.status_code(), 400);
        assert_eq!(Kind::Unauthenticated.status_code(), 401);
        assert_eq!(Kind::Forbidden.status_code(), 403);
        assert_eq!(Kind::NotFound.status_code(), 404);
        assert_eq!(Kind::MethodNotAllowed.status_code(), 405);
        assert_eq!(Kind::Internal.status_code(), 500);
    }

    #[test]
    fn admission_errors_are_unauthenticated_except_unknown_route() {
        assert_eq!(ErrorCode::AdmissionBadSignature.kind(), Kind::Unauthenticated);
        assert_eq!(ErrorCode::AdmissionStaleTimestamp.kind(), Kind::Unauthenticated);
        assert_eq!(ErrorCode::AdmissionUnknownRoute.kind(), Kind::NotFound);
        assert_eq!(ErrorCode::AdmissionBodyUnreadable.kind(), Kind::BadRequest);
    }

    #[test]
    fn rbac_errors_are_forbidden() {
        assert_eq!(ErrorCode::RbacOriginNotAllowed.kind(), Kind::Forbidden);
        assert_eq!(ErrorCode::RbacWrongNeedOwner.kind(), Kind::Forbidden);
    }

    #[test]
    fn worker_not_found_is_not_found_but_other_worker_errors_are_internal() {
        assert_eq!(ErrorCode::WorkerNotFound.kind(), Kind::NotFound);
        assert_eq!(ErrorCode::WorkerNonZeroExit.kind(), Kind::Internal);
        assert_eq!(ErrorCode::WorkerSpawnFailed.kind(), Kind::Internal);
    }

    #[test]
    fn wire_body_only_carries_message() {
        let err = FortError::new(ErrorCode::WorkerNonZeroExit, "worker exited 1: boom")
            .with_context("capability", "tokens");
        assert_eq!(
            err.wire_body(),
            serde_json::json!({"error": "worker exited 1: boom"})
        );
    }

    #[test]
    fn display_format() {
        let err = FortError::new(ErrorCode::AdmissionUnknownOrigin, "unknown origin 'nowhere'");
        assert_eq!(
            err.to_string(),
            "[ADMISSION_UNKNOWN_ORIGIN] unknown origin 'nowhere'"
        );
    }

    #[test]
    fn code_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::HandlePersistFailed).unwrap();
        assert_eq!(json, "\"HANDLE_PERSIST_FAILED\"");
    }

    #[test]
    fn kind_serializes_kebab_case() {
        let json = serde_json::to_string(&Kind::NotFound).unwrap();
        assert_eq!(json, "\"not-found\"");
    }

    #[test]
    fn macro_builds_error() {
        let err = fort_err!(ErrorCode::Internal, "boom {}", 42);
        assert_eq!(err.message, "boom 42");
        assert_eq!(err.code, ErrorCode::Internal);
    }
}
