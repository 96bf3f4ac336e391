// JSON envelopes exchanged over broker topics.
pub mod body;
pub mod request;
pub mod response;
pub mod sync;

pub use body::{Body, BodyKind, BodyRegistry};
pub use request::{Request, RequestBuilder, RequestType};
pub use response::Response;
pub use sync::{SubscriptionSyncMessage, SyncAction};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize message")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(#[source] serde_json::Error),
    #[error("no decoder registered for content type {0}")]
    UnknownContentType(String),
    #[error("expected content type {expected}, got {actual}")]
    ContentTypeMismatch {
        expected: &'static str,
        actual: String,
    },
}

// Shared by every envelope; keeps the serde error mapping in one place.
pub(crate) fn to_bytes<T: serde::Serialize>(value: &T) -> Result<bytes::Bytes> {
    serde_json::to_vec(value)
        .map(bytes::Bytes::from)
        .map_err(Error::Serialize)
}

pub(crate) fn from_slice<T: serde::de::DeserializeOwned>(input: &[u8]) -> Result<T> {
    serde_json::from_slice(input).map_err(Error::Deserialize)
}
