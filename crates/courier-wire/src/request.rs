use bytes::Bytes;
use courier_common::ids::CorrelationId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Body, Result};

/// Content type of the body carried by ping requests and their replies.
pub const PING_CONTENT_TYPE: &str = "ping";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestType {
    #[default]
    ClientRequest,
    Ping,
}

/// Immutable request envelope; build one with [`Request::builder`].
///
/// ```
/// use courier_wire::{Body, Request};
///
/// let request = Request::builder()
///     .correlation_id("abc")
///     .body(Body::text("echo", "ping"))
///     .partition_key("device-1")
///     .build();
/// let decoded = Request::decode(&request.encode().expect("encode")).expect("decode");
/// assert_eq!(decoded, request);
/// assert!(decoded.single_reply());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    correlation_id: CorrelationId,
    body: Body,
    partition_key: Option<String>,
    reply_to: Option<String>,
    single_reply: bool,
    kind: RequestType,
}

impl Request {
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    pub fn ping(reply_to: impl Into<String>) -> Self {
        Self::builder()
            .kind(RequestType::Ping)
            .body(Body::empty(PING_CONTENT_TYPE))
            .reply_to(reply_to)
            .build()
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn single_reply(&self) -> bool {
        self.single_reply
    }

    pub fn kind(&self) -> RequestType {
        self.kind
    }

    pub fn is_ping(&self) -> bool {
        self.kind == RequestType::Ping
    }

    /// Copy of this request routed to `topic` when no reply topic is set.
    pub fn or_reply_to(self, topic: &str) -> Self {
        if self.reply_to.is_some() {
            return self;
        }
        Self {
            reply_to: Some(topic.to_string()),
            ..self
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        crate::to_bytes(&RequestWire::from(self))
    }

    pub fn decode(input: &[u8]) -> Result<Self> {
        let wire: RequestWire = crate::from_slice(input)?;
        Ok(wire.into())
    }
}

#[derive(Debug, Default)]
pub struct RequestBuilder {
    correlation_id: Option<CorrelationId>,
    body: Option<Body>,
    partition_key: Option<String>,
    reply_to: Option<String>,
    single_reply: Option<bool>,
    kind: RequestType,
}

impl RequestBuilder {
    pub fn correlation_id(mut self, id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    pub fn reply_to(mut self, topic: impl Into<String>) -> Self {
        self.reply_to = Some(topic.into());
        self
    }

    pub fn single_reply(mut self, single_reply: bool) -> Self {
        self.single_reply = Some(single_reply);
        self
    }

    pub fn kind(mut self, kind: RequestType) -> Self {
        self.kind = kind;
        self
    }

    // Missing correlation ids are generated; requests default to single reply.
    pub fn build(self) -> Request {
        Request {
            correlation_id: self.correlation_id.unwrap_or_default(),
            body: self.body.unwrap_or_else(|| Body::empty("")),
            partition_key: self.partition_key,
            reply_to: self.reply_to,
            single_reply: self.single_reply.unwrap_or(true),
            kind: self.kind,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestWire {
    content_type: String,
    #[serde(default)]
    body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
    correlation_id: CorrelationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    partition_key: Option<String>,
    #[serde(default = "default_single_reply")]
    single_reply: bool,
    #[serde(default, rename = "type")]
    kind: RequestType,
}

fn default_single_reply() -> bool {
    true
}

impl From<&Request> for RequestWire {
    fn from(request: &Request) -> Self {
        Self {
            content_type: request.body.content_type().to_string(),
            body: request.body.value().clone(),
            reply_to: request.reply_to.clone(),
            correlation_id: request.correlation_id.clone(),
            partition_key: request.partition_key.clone(),
            single_reply: request.single_reply,
            kind: request.kind,
        }
    }
}

impl From<RequestWire> for Request {
    fn from(wire: RequestWire) -> Self {
        Self {
            correlation_id: wire.correlation_id,
            body: Body::new(wire.content_type, wire.body),
            partition_key: wire.partition_key,
            reply_to: wire.reply_to,
            single_reply: wire.single_reply,
            kind: wire.kind,
        }
    }
}
