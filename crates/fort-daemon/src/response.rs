//! A transport-independent HTTP response, and the `FortError` -> wire
//! translation shared by every handler.

use fort_error::FortError;

/// An HTTP response, independent of the transport that will write it.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// Status code.
    pub status: u16,
    /// Header name/value pairs, in addition to `Content-Type`.
    pub headers: Vec<(String, String)>,
    /// Response body bytes.
    pub body: Vec<u8>,
}

impl RawResponse {
    /// A `200`/`202`/etc JSON response built from a [`serde_json::Value`].
    #[must_use]
    pub fn json(status: u16, value: serde_json::Value) -> Self {
        Self::json_bytes(status, serde_json::to_vec(&value).unwrap_or_default())
    }

    /// A JSON response whose body is already-serialized bytes (e.g. a
    /// worker's raw stdout, echoed verbatim on the RPC path).
    #[must_use]
    pub fn json_bytes(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    /// Translate a [`FortError`] into the broker's standard error
    /// response: `{"error": "<message>"}` with the status from its
    /// [`fort_error::Kind`].
    #[must_use]
    pub fn from_error(err: &FortError) -> Self {
        tracing::warn!(
            target: "fort.admission",
            code = err.code.as_str(),
            message = %err.message,
            "request rejected"
        );
        Self::json(err.kind().status_code(), err.wire_body())
    }
}
