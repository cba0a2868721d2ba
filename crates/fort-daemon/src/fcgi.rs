//! FastCGI transport glue: bridges the blocking `fastcgi` crate's
//! request/response API into the async admission/dispatch pipeline via
//! a borrowed [`tokio::runtime::Handle`].

use crate::admission::RawRequest;
use crate::response::RawResponse;
use crate::AppState;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

const HEADER_ORIGIN: &str = "HTTP_X_FORT_ORIGIN";
const HEADER_TIMESTAMP: &str = "HTTP_X_FORT_TIMESTAMP";
const HEADER_SIGNATURE: &str = "HTTP_X_FORT_SIGNATURE";

/// Serve FastCGI requests over the socket handed to the process on
/// standard input, per the conventional FastCGI deployment. Blocks the
/// calling thread; `fastcgi::run` dispatches each connection onto its
/// own worker thread, so every request borrows `state`/`runtime`
/// through the closure rather than owning them.
pub fn serve(state: Arc<AppState>, runtime: tokio::runtime::Handle) {
    fastcgi::run(move |mut request| {
        let raw = match read_request(&mut request) {
            Ok(raw) => raw,
            Err(message) => {
                warn!(target: "fort.fcgi", message = %message, "failed to read fastcgi request");
                write_response(
                    &mut request,
                    &RawResponse::json(400, serde_json::json!({"error": message})),
                );
                return;
            }
        };

        let now = now_unix();
        let response = runtime.block_on(crate::handle_request(&state, raw, now));
        write_response(&mut request, &response);
    });
}

fn read_request(request: &mut fastcgi::Request) -> Result<RawRequest, String> {
    let method = request
        .param("REQUEST_METHOD")
        .unwrap_or_else(|| "POST".to_string());
    let path = request
        .param("PATH_INFO")
        .or_else(|| request.param("SCRIPT_NAME"))
        .unwrap_or_default();

    let mut body = Vec::new();
    request
        .read_to_end(&mut body)
        .map_err(|e| format!("failed to read request body: {e}"))?;

    Ok(RawRequest {
        method,
        path,
        origin: request.param(HEADER_ORIGIN),
        timestamp: request.param(HEADER_TIMESTAMP),
        signature: request.param(HEADER_SIGNATURE),
        body,
    })
}

fn write_response(request: &mut fastcgi::Request, response: &RawResponse) {
    let mut head = format!(
        "Status: {}\r\nContent-Type: application/json\r\n",
        response.status
    );
    for (name, value) in &response.headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    let stdout = request.stdout();
    let write_result = stdout
        .write_all(head.as_bytes())
        .and_then(|()| stdout.write_all(&response.body));
    if let Err(e) = write_result {
        warn!(target: "fort.fcgi", error = %e, "failed to write fastcgi response");
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
