// Shared identifiers and subscription model types used across crates.
use uuid::Uuid;

pub mod model;

pub use model::{ALL_DEVICES, DeviceRef, EventKey, EventKind, Filter, Subscriber};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
}

pub mod ids {
    // Strongly typed IDs so subscription and instance ids cannot be swapped.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;
    use std::sync::Arc;
    use uuid::Uuid;

    macro_rules! id_type {
        ($name:ident) => {
            #[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(Uuid);

            impl $name {
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                pub fn from_uuid(uuid: Uuid) -> Self {
                    Self(uuid)
                }

                pub fn as_uuid(&self) -> Uuid {
                    self.0
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $name {
                type Err = Error;

                fn from_str(input: &str) -> Result<Self> {
                    // Preserve the original input for clearer error messages.
                    let uuid =
                        Uuid::parse_str(input).map_err(|_| Error::InvalidId(input.into()))?;
                    Ok(Self(uuid))
                }
            }
        };
    }

    id_type!(SubscriptionId);
    id_type!(InstanceId);

    /// Opaque correlation token linking a request to its responses.
    ///
    /// Callers may supply any string; `CorrelationId::new` generates a UUID.
    #[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct CorrelationId(Arc<str>);

    impl CorrelationId {
        pub fn new() -> Self {
            Self(Uuid::new_v4().to_string().into())
        }

        pub fn as_str(&self) -> &str {
            &self.0
        }
    }

    impl Default for CorrelationId {
        fn default() -> Self {
            Self::new()
        }
    }

    impl fmt::Display for CorrelationId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl From<&str> for CorrelationId {
        fn from(value: &str) -> Self {
            Self(value.into())
        }
    }

    impl From<String> for CorrelationId {
        fn from(value: String) -> Self {
            Self(value.into())
        }
    }
}

/// Best-effort stable identity for this host.
///
/// Reads `HOSTNAME`, then the kernel hostname; falls back to a random UUID so
/// callers always get a usable, topic-safe token.
///
/// ```
/// let id = courier_common::host_identity();
/// assert!(!id.is_empty());
/// assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
/// ```
pub fn host_identity() -> String {
    let raw = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/proc/sys/kernel/hostname").ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    match raw {
        Some(value) => sanitize_topic_token(&value),
        None => Uuid::new_v4().to_string(),
    }
}

// Topic names only allow [A-Za-z0-9._-]; dots are folded to keep names flat.
fn sanitize_topic_token(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::ids::{CorrelationId, InstanceId, SubscriptionId};
    use super::{Error, sanitize_topic_token};
    use std::str::FromStr;

    #[test]
    fn subscription_id_round_trip() {
        let id = SubscriptionId::new();
        let parsed = SubscriptionId::from_str(&id.to_string()).expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn instance_id_rejects_invalid_input() {
        let err = InstanceId::from_str("not-a-uuid").expect_err("invalid");
        assert!(matches!(err, Error::InvalidId(s) if s == "not-a-uuid"));
    }

    #[test]
    fn correlation_id_accepts_arbitrary_strings() {
        let id = CorrelationId::from("abc");
        assert_eq!(id.as_str(), "abc");
        assert_eq!(serde_json::to_string(&id).expect("json"), "\"abc\"");
        let back: CorrelationId = serde_json::from_str("\"abc\"").expect("decode");
        assert_eq!(back, id);
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_topic_token("node-1.example/x"), "node-1_example_x");
    }
}
