//! Trigger / GC / initialize sweep modes. All three share the
//! same state machine over the provider-state store; they differ only
//! in which keys they touch and whether they dispatch callbacks.

use crate::AppState;
use fort_core::{CapabilityConfig, CapabilityMode};
use fort_error::{fort_err, ErrorCode, FortError};
use fort_worker::TriggerKind;
use std::collections::BTreeSet;
use tracing::info;

/// Run once on broker start: every capability with `triggers.initialize`
/// and non-empty state gets its worker re-invoked on the full view, and
/// **every** key in the output is dispatched (not only changed ones),
/// so consumers receive current state after a restart.
pub async fn initialize(state: &AppState, now: i64) -> Result<(), FortError> {
    let capabilities: Vec<(String, CapabilityConfig)> = state
        .domain
        .capabilities
        .iter()
        .filter(|(_, cfg)| cfg.triggers.initialize)
        .map(|(name, cfg)| (name.clone(), cfg.clone()))
        .collect();

    for (capability, config) in capabilities {
        let snapshot = state.provider_state.snapshot_capability(&capability).await;
        if snapshot.is_empty() {
            continue;
        }

        let handler_path = state.broker.handler_path(&capability);
        let responses = fort_worker::run_async(
            &handler_path,
            &capability,
            None,
            Some(TriggerKind::Initialize),
            config.format,
            &snapshot,
        )
        .await
        .map_err(|e| {
            fort_err!(
                ErrorCode::WorkerNonZeroExit,
                "initialize worker '{capability}' failed: {e}"
            )
        })?;

        state
            .provider_state
            .apply_responses(&capability, &responses, now)
            .await
            .map_err(|e| fort_err!(ErrorCode::StateWriteFailed, "{e}"))?;

        let all_keys: Vec<String> = responses.keys().cloned().collect();
        let jobs = fort_callback::build_jobs(&capability, &all_keys, &[], |k| responses.get(k).cloned());
        info!(capability = %capability, dispatched = jobs.len(), "initialize sweep");
        for job in jobs {
            state.callbacks.enqueue(job);
        }
    }
    Ok(())
}

/// `--trigger <capability>`: identical to the async-request path
/// except there is no triggering request body and no HTTP response —
/// the worker re-evaluates the current view and changed/revoked keys
/// drive callbacks exactly as they would inline.
pub async fn trigger(state: &AppState, capability: &str, now: i64) -> Result<(), FortError> {
    let config = state
        .domain
        .capabilities
        .get(capability)
        .cloned()
        .ok_or_else(|| fort_err!(ErrorCode::ConfigMissing, "unknown capability '{capability}'"))?;

    let snapshot = state.provider_state.snapshot_capability(capability).await;
    let handler_path = state.broker.handler_path(capability);
    let responses = fort_worker::run_async(
        &handler_path,
        capability,
        None,
        Some(TriggerKind::Systemd),
        config.format,
        &snapshot,
    )
    .await
    .map_err(|e| fort_err!(ErrorCode::WorkerNonZeroExit, "trigger worker '{capability}' failed: {e}"))?;

    let outcome = state
        .provider_state
        .apply_responses(capability, &responses, now)
        .await
        .map_err(|e| fort_err!(ErrorCode::StateWriteFailed, "{e}"))?;

    let jobs = fort_callback::build_jobs(capability, &outcome.changed, &outcome.revoked, |k| {
        responses.get(k).cloned()
    });
    info!(capability, dispatched = jobs.len(), "systemd trigger sweep");
    for job in jobs {
        state.callbacks.enqueue(job);
    }
    Ok(())
}

/// `--gc`: positive-absence reclaim plus TTL rotation across every
/// async/`needs_gc` capability.
pub async fn gc(state: &AppState, now: i64) -> Result<(), FortError> {
    let capabilities: Vec<(String, CapabilityConfig)> = state
        .domain
        .capabilities
        .iter()
        .filter(|(_, cfg)| matches!(cfg.effective_mode(), CapabilityMode::Async))
        .map(|(name, cfg)| (name.clone(), cfg.clone()))
        .collect();

    for (capability, config) in &capabilities {
        reclaim(state, capability, config, now).await?;
        if config.ttl > 0 {
            rotate(state, capability, config, now).await?;
        }
    }
    Ok(())
}

/// Positive-absence reclaim: remove state entries for (capability,
/// name) pairs a reachable origin no longer declares. Unreachable
/// origins are left untouched rather than assumed absent.
async fn reclaim(
    state: &AppState,
    capability: &str,
    config: &CapabilityConfig,
    now: i64,
) -> Result<(), FortError> {
    let origins = state.provider_state.distinct_origins(capability).await;
    let mut stale_keys = Vec::new();

    for origin in &origins {
        let declared = match state.signing_client.get_needs(origin).await {
            Ok(needs) => needs,
            Err(e) => {
                info!(capability, origin, error = %e, "origin unreachable during gc; state retained");
                continue;
            }
        };
        let declared: BTreeSet<String> = declared.into_iter().collect();

        for need_id in state.provider_state.declared_pairs_for_origin(capability, origin).await {
            let Some(name) = need_id.strip_prefix(capability).and_then(|r| r.strip_prefix('-')) else {
                continue;
            };
            let pair = format!("{capability}/{name}");
            if !declared.contains(&pair) {
                stale_keys.push(format!("{origin}:{need_id}"));
            }
        }
    }

    if stale_keys.is_empty() {
        return Ok(());
    }

    state
        .provider_state
        .remove_keys(capability, &stale_keys)
        .await
        .map_err(|e| fort_err!(ErrorCode::StateWriteFailed, "{e}"))?;
    info!(capability, removed = stale_keys.len(), "gc positive-absence reclaim");

    // Cleanup invocation: re-invoke the worker on the reduced view so
    // it can release external resources, but suppress callback
    // dispatch for this pass (change detection is not acted on here).
    let snapshot = state.provider_state.snapshot_capability(capability).await;
    let handler_path = state.broker.handler_path(capability);
    if let Ok(responses) = fort_worker::run_async(
        &handler_path,
        capability,
        None,
        Some(TriggerKind::Gc),
        config.format,
        &snapshot,
    )
    .await
    {
        let _ = state.provider_state.apply_responses(capability, &responses, now).await;
    }
    Ok(())
}

/// TTL rotation. If any of a `ttl > 0` capability's persisted
/// responses has a handle within `2 * gc-interval` of expiry, invoke
/// the worker on the current view and dispatch callbacks for any
/// changed responses, then mint fresh handles for the new content.
async fn rotate(
    state: &AppState,
    capability: &str,
    config: &CapabilityConfig,
    now: i64,
) -> Result<(), FortError> {
    let snapshot = state.provider_state.snapshot_capability(capability).await;
    let rotation_window = i64::try_from(state.broker.rotation_window_secs()).unwrap_or(i64::MAX);

    let near_expiry = snapshot.values().any(|entry| {
        entry.response.as_ref().is_some_and(|response| {
            let bytes = serde_json::to_vec(response).unwrap_or_default();
            let handle = fort_core::compute_handle(&bytes);
            state
                .handles
                .read_meta(&handle)
                .ok()
                .flatten()
                .is_some_and(|meta| meta.expiry - now <= rotation_window)
        })
    });
    if !near_expiry {
        return Ok(());
    }

    let handler_path = state.broker.handler_path(capability);
    let responses = fort_worker::run_async(
        &handler_path,
        capability,
        None,
        Some(TriggerKind::Gc),
        config.format,
        &snapshot,
    )
    .await
    .map_err(|e| fort_err!(ErrorCode::WorkerNonZeroExit, "rotation worker '{capability}' failed: {e}"))?;

    let outcome = state
        .provider_state
        .apply_responses(capability, &responses, now)
        .await
        .map_err(|e| fort_err!(ErrorCode::StateWriteFailed, "{e}"))?;

    let jobs = fort_callback::build_jobs(capability, &outcome.changed, &outcome.revoked, |k| {
        responses.get(k).cloned()
    });
    info!(capability, rotated = jobs.len(), "gc rotation");
    for job in jobs {
        state.callbacks.enqueue(job);
    }

    if config.needs_gc {
        for response in responses.values() {
            if fort_core::is_error_response(response) {
                continue;
            }
            let bytes = serde_json::to_vec(response).unwrap_or_default();
            let _ = state.handles.persist(&bytes, config.ttl, now);
        }
    }
    Ok(())
}
