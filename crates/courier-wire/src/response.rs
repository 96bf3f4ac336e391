use bytes::Bytes;
use courier_common::ids::CorrelationId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Body, Result};

/// Immutable response envelope.
///
/// ```
/// use courier_wire::{Body, Response};
///
/// let ok = Response::ok("abc".into(), Body::text("echo", "pong"));
/// assert!(ok.is_last() && !ok.is_failed());
///
/// let failed = Response::failure("abc".into(), 500, "boom");
/// assert!(failed.is_failed());
/// assert_eq!(failed.error_code(), 500);
/// assert_eq!(failed.body().as_str(), Some("boom"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    correlation_id: CorrelationId,
    body: Body,
    error_code: i32,
    failed: bool,
    last: bool,
}

impl Response {
    pub fn new(
        correlation_id: CorrelationId,
        body: Body,
        error_code: i32,
        failed: bool,
        last: bool,
    ) -> Self {
        Self {
            correlation_id,
            body,
            error_code,
            failed,
            last,
        }
    }

    /// Successful terminal response.
    pub fn ok(correlation_id: CorrelationId, body: Body) -> Self {
        Self::new(correlation_id, body, 0, false, true)
    }

    /// Non-terminal response in a stream.
    pub fn chunk(correlation_id: CorrelationId, body: Body) -> Self {
        Self::new(correlation_id, body, 0, false, false)
    }

    /// Terminal failure carrying `message` in an error body.
    pub fn failure(correlation_id: CorrelationId, error_code: i32, message: impl Into<String>) -> Self {
        Self::new(correlation_id, Body::error(message), error_code, true, true)
    }

    /// Same response re-addressed to another correlation id.
    pub fn readdress(self, correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            ..self
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn into_body(self) -> Body {
        self.body
    }

    pub fn error_code(&self) -> i32 {
        self.error_code
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn is_last(&self) -> bool {
        self.last
    }

    pub fn encode(&self) -> Result<Bytes> {
        crate::to_bytes(&ResponseWire::from(self))
    }

    pub fn decode(input: &[u8]) -> Result<Self> {
        let wire: ResponseWire = crate::from_slice(input)?;
        Ok(wire.into())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseWire {
    content_type: String,
    #[serde(default)]
    body: Value,
    correlation_id: CorrelationId,
    #[serde(default)]
    error_code: i32,
    #[serde(default)]
    failed: bool,
    #[serde(default = "default_last")]
    last: bool,
}

fn default_last() -> bool {
    true
}

impl From<&Response> for ResponseWire {
    fn from(response: &Response) -> Self {
        let (content_type, body) = response.body.clone().into_parts();
        Self {
            content_type,
            body,
            correlation_id: response.correlation_id.clone(),
            error_code: response.error_code,
            failed: response.failed,
            last: response.last,
        }
    }
}

impl From<ResponseWire> for Response {
    fn from(wire: ResponseWire) -> Self {
        Self {
            correlation_id: wire.correlation_id,
            body: Body::new(wire.content_type, wire.body),
            error_code: wire.error_code,
            failed: wire.failed,
            last: wire.last,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_is_encoded_with_error_fields() {
        let response = Response::failure("abc".into(), 500, "handler failed");
        let json: Value =
            serde_json::from_slice(&response.encode().expect("encode")).expect("json");
        assert_eq!(
            json,
            serde_json::json!({
                "contentType": "error",
                "body": "handler failed",
                "correlationId": "abc",
                "errorCode": 500,
                "failed": true,
                "last": true,
            })
        );
    }

    #[test]
    fn chunk_round_trips_as_non_terminal() {
        let response = Response::chunk("s1".into(), Body::text("event", "x"));
        let decoded = Response::decode(&response.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, response);
        assert!(!decoded.is_last());
    }

    #[test]
    fn readdress_keeps_payload() {
        let response = Response::ok("a".into(), Body::text("echo", "pong")).readdress("b".into());
        assert_eq!(response.correlation_id().as_str(), "b");
        assert_eq!(response.body().as_str(), Some("pong"));
    }
}
