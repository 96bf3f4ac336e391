// Tagged payloads: a logical content type plus a JSON value.
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::{Error, Result};

/// Content type used for handler failures; the value is the message string.
pub const ERROR_CONTENT_TYPE: &str = "error";

/// Opaque request/response payload.
///
/// ```
/// use courier_wire::Body;
///
/// let body = Body::text("echo", "ping");
/// assert_eq!(body.content_type(), "echo");
/// assert_eq!(body.as_str(), Some("ping"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Body {
    content_type: String,
    value: Value,
}

impl Body {
    pub fn new(content_type: impl Into<String>, value: Value) -> Self {
        Self {
            content_type: content_type.into(),
            value,
        }
    }

    pub fn text(content_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(content_type, Value::String(text.into()))
    }

    pub fn empty(content_type: impl Into<String>) -> Self {
        Self::new(content_type, Value::Null)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::text(ERROR_CONTENT_TYPE, message)
    }

    /// Encode a typed payload under its declared content type.
    pub fn from_kind<T: BodyKind + Serialize>(payload: &T) -> Result<Self> {
        let value = serde_json::to_value(payload).map_err(Error::Serialize)?;
        Ok(Self::new(T::CONTENT_TYPE, value))
    }

    /// Decode into `T`, refusing bodies tagged with another content type.
    pub fn decode_as<T: BodyKind + DeserializeOwned>(&self) -> Result<T> {
        if self.content_type != T::CONTENT_TYPE {
            return Err(Error::ContentTypeMismatch {
                expected: T::CONTENT_TYPE,
                actual: self.content_type.clone(),
            });
        }
        serde_json::from_value(self.value.clone()).map_err(Error::Deserialize)
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }

    pub fn is_error(&self) -> bool {
        self.content_type == ERROR_CONTENT_TYPE
    }

    pub(crate) fn into_parts(self) -> (String, Value) {
        (self.content_type, self.value)
    }
}

/// A payload type bound to one content type string.
pub trait BodyKind {
    const CONTENT_TYPE: &'static str;
}

type DecodeFn<T> = Box<dyn Fn(&Body) -> Result<T> + Send + Sync>;

/// Maps content types to decoders producing an application sum type.
///
/// ```
/// use courier_wire::{Body, BodyKind, BodyRegistry};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Echo(String);
/// impl BodyKind for Echo {
///     const CONTENT_TYPE: &'static str = "echo";
/// }
///
/// enum Command {
///     Echo(String),
/// }
///
/// let registry = BodyRegistry::new().register(|Echo(text)| Command::Echo(text));
/// let body = Body::from_kind(&Echo("hi".into())).expect("encode");
/// let Command::Echo(text) = registry.decode(&body).expect("decode");
/// assert_eq!(text, "hi");
/// ```
pub struct BodyRegistry<T> {
    decoders: HashMap<&'static str, DecodeFn<T>>,
}

impl<T> BodyRegistry<T> {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    pub fn register<K, F>(mut self, wrap: F) -> Self
    where
        K: BodyKind + DeserializeOwned + 'static,
        F: Fn(K) -> T + Send + Sync + 'static,
    {
        self.decoders.insert(
            K::CONTENT_TYPE,
            Box::new(move |body: &Body| body.decode_as::<K>().map(&wrap)),
        );
        self
    }

    pub fn contains(&self, content_type: &str) -> bool {
        self.decoders.contains_key(content_type)
    }

    pub fn decode(&self, body: &Body) -> Result<T> {
        let decoder = self
            .decoders
            .get(body.content_type())
            .ok_or_else(|| Error::UnknownContentType(body.content_type().to_string()))?;
        decoder(body)
    }
}

impl<T> Default for BodyRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for BodyRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.decoders.keys().collect();
        types.sort();
        f.debug_struct("BodyRegistry")
            .field("content_types", &types)
            .finish()
    }
}
