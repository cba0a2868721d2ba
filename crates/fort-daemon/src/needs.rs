//! Need callback handling: a provider asserting (or revoking)
//! fulfillment of one of its declared needs.

use crate::admission::AdmittedCallback;
use crate::response::RawResponse;
use crate::AppState;
use fort_error::{fort_err, ErrorCode, FortError};

/// Run an admitted need callback to completion and build the
/// HTTP-facing response.
pub async fn execute(state: &AppState, req: AdmittedCallback) -> RawResponse {
    match run(state, &req).await {
        Ok(response) => response,
        Err(err) => RawResponse::from_error(&err),
    }
}

async fn run(state: &AppState, req: &AdmittedCallback) -> Result<RawResponse, FortError> {
    let satisfied = match &req.need.handler {
        Some(handler) => {
            let handler_path = std::path::PathBuf::from(handler);
            fort_worker::run_need_handler(
                &handler_path,
                &req.need.id,
                &req.need.capability,
                &req.origin,
                &req.body,
            )
            .await
            .map_err(|e| {
                fort_err!(
                    ErrorCode::WorkerNonZeroExit,
                    "need handler for '{}' failed: {e}",
                    req.need.id
                )
            })?
        }
        None => !trimmed_is_empty(&req.body),
    };

    state
        .fulfillment_state
        .update(&req.need.id, satisfied)
        .await
        .map_err(|e| fort_err!(ErrorCode::StateWriteFailed, "{e}"))?;

    Ok(RawResponse::json(
        200,
        serde_json::json!({"need_id": req.need.id, "satisfied": satisfied}),
    ))
}

fn trimmed_is_empty(body: &[u8]) -> bool {
    std::str::from_utf8(body).is_ok_and(|s| s.trim().is_empty()) || body.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_whitespace_bodies_are_empty() {
        assert!(trimmed_is_empty(b""));
        assert!(trimmed_is_empty(b"   \n"));
        assert!(!trimmed_is_empty(b"{}"));
    }
}
