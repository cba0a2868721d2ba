//! Capability execution: the RPC and async dispatch paths.

use crate::admission::AdmittedCapability;
use crate::response::RawResponse;
use crate::AppState;
use fort_core::{is_error_response, state_key};
use fort_error::{fort_err, ErrorCode, FortError};

/// Run an admitted capability invocation to completion and build the
/// HTTP-facing response.
pub async fn execute(state: &AppState, req: AdmittedCapability, now: i64) -> RawResponse {
    let capability_config = state.domain.capabilities.get(&req.capability).cloned();
    let mode = capability_config
        .as_ref()
        .map(fort_core::CapabilityConfig::effective_mode)
        .unwrap_or(fort_core::CapabilityMode::Rpc);

    let result = match mode {
        fort_core::CapabilityMode::Rpc => run_rpc(state, &req).await,
        fort_core::CapabilityMode::Async => {
            let config = capability_config.unwrap_or_else(|| fort_core::CapabilityConfig {
                mode: fort_core::CapabilityMode::Async,
                needs_gc: false,
                ttl: 0,
                cache_response: true,
                format: fort_core::AsyncFormat::Legacy,
                triggers: fort_core::Triggers::default(),
            });
            run_async(state, &req, &config, now).await
        }
    };

    match result {
        Ok(response) => response,
        Err(err) => RawResponse::from_error(&err),
    }
}

async fn run_rpc(state: &AppState, req: &AdmittedCapability) -> Result<RawResponse, FortError> {
    let handler_path = state.broker.handler_path(&req.capability);
    let stdout = fort_worker::run_rpc(&handler_path, &req.capability, &req.origin, &req.body)
        .await
        .map_err(|e| {
            fort_err!(
                ErrorCode::WorkerNonZeroExit,
                "worker '{}' failed: {e}",
                req.capability
            )
        })?;
    Ok(RawResponse::json_bytes(200, stdout))
}

async fn run_async(
    state: &AppState,
    req: &AdmittedCapability,
    config: &fort_core::CapabilityConfig,
    now: i64,
) -> Result<RawResponse, FortError> {
    let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap_or(serde_json::Value::Null);
    let need_id = fort_core::need_id_from_body(&body);
    let key = state_key(&req.origin, need_id);

    state
        .provider_state
        .upsert_request(&req.capability, &key, body, now)
        .await
        .map_err(|e| fort_err!(ErrorCode::StateWriteFailed, "{e}"))?;

    let snapshot = state.provider_state.snapshot_capability(&req.capability).await;

    let handler_path = state.broker.handler_path(&req.capability);
    let responses = fort_worker::run_async(
        &handler_path,
        &req.capability,
        Some(&req.origin),
        None,
        config.format,
        &snapshot,
    )
    .await
    .map_err(|e| {
        fort_err!(
            ErrorCode::WorkerNonZeroExit,
            "worker '{}' failed: {e}",
            req.capability
        )
    })?;

    let outcome = state
        .provider_state
        .apply_responses(&req.capability, &responses, now)
        .await
        .map_err(|e| fort_err!(ErrorCode::StateWriteFailed, "{e}"))?;

    for job in fort_callback::build_jobs(&req.capability, &outcome.changed, &outcome.revoked, |k| {
        responses.get(k).cloned()
    }) {
        state.callbacks.enqueue(job);
    }

    let mut response = RawResponse::json(202, serde_json::json!({"status": "accepted"}));

    if config.needs_gc {
        if let Some(trigger_response) = responses.get(&key) {
            if !is_error_response(trigger_response) {
                let bytes = serde_json::to_vec(trigger_response).unwrap_or_default();
                let persisted = state
                    .handles
                    .persist(&bytes, config.ttl, now)
                    .map_err(|e| fort_err!(ErrorCode::HandlePersistFailed, "{e}"))?;
                response.headers.push(("X-Fort-Handle".to_string(), persisted.handle));
                if let Some(meta) = persisted.meta {
                    response
                        .headers
                        .push(("X-Fort-TTL".to_string(), meta.ttl.to_string()));
                }
            }
        }
    }

    Ok(response)
}
