//! Admission checks. Shared header/timestamp/origin/
//! signature verification, then the capability- or callback-specific
//! checks that follow it.

use crate::AppState;
use fort_core::NeedConfig;
use fort_error::{fort_err, ErrorCode, FortError};

/// The raw bytes and headers of an inbound request, independent of the
/// transport that produced them.
#[derive(Debug, Clone)]
pub struct RawRequest {
    /// HTTP method, e.g. `"POST"`.
    pub method: String,
    /// Path exactly as received, leading slash, no query string.
    pub path: String,
    /// `X-Fort-Origin`.
    pub origin: Option<String>,
    /// `X-Fort-Timestamp`, verbatim.
    pub timestamp: Option<String>,
    /// `X-Fort-Signature`, base64, not yet armored.
    pub signature: Option<String>,
    /// Raw request body.
    pub body: Vec<u8>,
}

/// A capability invocation that has passed every admission check.
#[derive(Debug, Clone)]
pub struct AdmittedCapability {
    /// The capability being invoked.
    pub capability: String,
    /// The verified caller.
    pub origin: String,
    /// The request body.
    pub body: Vec<u8>,
}

/// A need-fulfillment callback that has passed every admission check.
#[derive(Debug, Clone)]
pub struct AdmittedCallback {
    /// The need being satisfied or revoked.
    pub need: NeedConfig,
    /// The verified caller (must equal `need.from`).
    pub origin: String,
    /// The request body.
    pub body: Vec<u8>,
}

/// Steps 1-4: headers present, timestamp within the replay window,
/// origin known, signature verifies. Common to both capability and
/// callback admission.
async fn verify_common(
    state: &AppState,
    req: &RawRequest,
    now: i64,
) -> Result<String, FortError> {
    let origin = req.origin.as_deref().ok_or_else(|| {
        fort_err!(ErrorCode::AdmissionMissingHeaders, "missing X-Fort-Origin header")
    })?;
    let timestamp = req.timestamp.as_deref().ok_or_else(|| {
        fort_err!(ErrorCode::AdmissionMissingHeaders, "missing X-Fort-Timestamp header")
    })?;
    let signature = req.signature.as_deref().ok_or_else(|| {
        fort_err!(ErrorCode::AdmissionMissingHeaders, "missing X-Fort-Signature header")
    })?;

    let ts: i64 = timestamp.parse().map_err(|_| {
        fort_err!(
            ErrorCode::AdmissionStaleTimestamp,
            "timestamp '{timestamp}' is not a valid integer"
        )
    })?;
    if (now - ts).abs() > fort_core::MAX_TIMESTAMP_DRIFT_SECS {
        return Err(fort_err!(
            ErrorCode::AdmissionStaleTimestamp,
            "timestamp {ts} is outside the {}s replay window",
            fort_core::MAX_TIMESTAMP_DRIFT_SECS
        ));
    }

    let host = state.domain.hosts.get(origin).ok_or_else(|| {
        fort_err!(ErrorCode::AdmissionUnknownOrigin, "unknown origin '{origin}'")
    })?;

    fort_sign::verify(
        origin,
        &host.pubkey,
        &req.method,
        &req.path,
        timestamp,
        &req.body,
        signature,
    )
    .await
    .map_err(|e| {
        fort_err!(ErrorCode::AdmissionBadSignature, "signature verification failed: {e}")
    })?;

    Ok(origin.to_string())
}

/// Admit a `/fort/<capability>` (or legacy `/agent/<capability>`)
/// invocation: steps 1-4 plus 5 (RBAC) and 6 (handler exists).
pub async fn admit_capability(
    state: &AppState,
    req: &RawRequest,
    capability: &str,
    now: i64,
) -> Result<AdmittedCapability, FortError> {
    let origin = verify_common(state, req, now).await?;

    let decision = state.rbac.can_invoke(capability, &origin);
    if !decision.allowed {
        return Err(fort_err!(
            ErrorCode::RbacOriginNotAllowed,
            "{}",
            decision.reason.unwrap_or_default()
        ));
    }

    let handler_path = state.broker.handler_path(capability);
    if tokio::fs::metadata(&handler_path).await.is_err() {
        return Err(fort_err!(
            ErrorCode::WorkerNotFound,
            "no handler installed for capability '{capability}'"
        ));
    }

    Ok(AdmittedCapability {
        capability: capability.to_string(),
        origin,
        body: req.body.clone(),
    })
}

/// Admit a `/fort/needs/<capability>/<name>` callback: steps 1-4 plus
/// 7 (need-id known, origin matches its declared `from`).
pub async fn admit_callback(
    state: &AppState,
    req: &RawRequest,
    capability: &str,
    name: &str,
    now: i64,
) -> Result<AdmittedCallback, FortError> {
    let origin = verify_common(state, req, now).await?;

    let need_id = format!("{capability}-{name}");
    let need = state.domain.needs.get(&need_id).cloned().ok_or_else(|| {
        fort_err!(ErrorCode::AdmissionUnknownNeed, "unknown need '{need_id}'")
    })?;

    let decision = fort_rbac::RbacEngine::can_satisfy_need(&need, &origin);
    if !decision.allowed {
        return Err(fort_err!(
            ErrorCode::RbacWrongNeedOwner,
            "{}",
            decision.reason.unwrap_or_default()
        ));
    }

    Ok(AdmittedCallback {
        need,
        origin,
        body: req.body.clone(),
    })
}
