// Subscription model shared by the registry, the wire codec and the event bus.
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;

use crate::ids::{CorrelationId, SubscriptionId};

/// Reserved device id meaning "every device" for a subscription.
pub const ALL_DEVICES: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Command,
    CommandUpdate,
    Notification,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::CommandUpdate => "command_update",
            Self::Notification => "notification",
        }
    }
}

/// Predicate over event dimensions. An absent dimension matches everything.
///
/// ```
/// use courier_common::{EventKey, EventKind, Filter};
///
/// let filter = Filter::new(EventKind::Notification)
///     .with_devices(["D1"])
///     .with_names(["temp"]);
/// let hit = EventKey::new(EventKind::Notification).device("D1").name("temp");
/// let miss = EventKey::new(EventKind::Notification).device("D1").name("humidity");
/// assert!(filter.matches(&hit));
/// assert!(!filter.matches(&miss));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub kind: EventKind,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub device_ids: Option<BTreeSet<String>>,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub network_ids: Option<BTreeSet<i64>>,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub device_type_ids: Option<BTreeSet<i64>>,
    #[serde(
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub names: Option<BTreeSet<String>>,
}

impl Filter {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            device_ids: None,
            network_ids: None,
            device_type_ids: None,
            names: None,
        }
    }

    /// Filter bound to the `ALL_DEVICES` sentinel.
    pub fn all_devices(kind: EventKind) -> Self {
        Self::new(kind).with_devices([ALL_DEVICES])
    }

    // Empty iterators leave the dimension unset rather than matching nothing.
    pub fn with_devices<I, S>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.device_ids = non_empty(devices.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_networks(mut self, networks: impl IntoIterator<Item = i64>) -> Self {
        self.network_ids = non_empty(networks.into_iter().collect());
        self
    }

    pub fn with_device_types(mut self, device_types: impl IntoIterator<Item = i64>) -> Self {
        self.device_type_ids = non_empty(device_types.into_iter().collect());
        self
    }

    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = non_empty(names.into_iter().map(Into::into).collect());
        self
    }

    /// True when the device dimension is absent or carries the sentinel.
    pub fn covers_all_devices(&self) -> bool {
        match &self.device_ids {
            None => true,
            Some(devices) => devices.contains(ALL_DEVICES),
        }
    }

    /// Concrete device ids, excluding the sentinel.
    pub fn concrete_devices(&self) -> impl Iterator<Item = &str> {
        self.device_ids
            .iter()
            .flatten()
            .map(String::as_str)
            .filter(|id| *id != ALL_DEVICES)
    }

    pub fn references_device(&self, device_id: &str) -> bool {
        self.device_ids
            .as_ref()
            .is_some_and(|devices| devices.contains(device_id))
    }

    pub fn references_network(&self, network_id: i64) -> bool {
        self.network_ids
            .as_ref()
            .is_some_and(|networks| networks.contains(&network_id))
    }

    pub fn references_device_type(&self, device_type_id: i64) -> bool {
        self.device_type_ids
            .as_ref()
            .is_some_and(|types| types.contains(&device_type_id))
    }

    pub fn matches(&self, event: &EventKey<'_>) -> bool {
        if self.kind != event.kind {
            return false;
        }
        let device_ok = self.covers_all_devices()
            || event
                .device_id
                .is_some_and(|id| self.references_device(id));
        device_ok
            && dimension_matches(self.network_ids.as_ref(), event.network_id.as_ref())
            && dimension_matches(self.device_type_ids.as_ref(), event.device_type_id.as_ref())
            && match (&self.names, event.name) {
                (None, _) => true,
                (Some(names), Some(name)) => names.contains(name),
                (Some(_), None) => false,
            }
    }
}

fn non_empty<T: Ord>(set: BTreeSet<T>) -> Option<BTreeSet<T>> {
    if set.is_empty() { None } else { Some(set) }
}

// `[]` on the wire means the same as a missing dimension.
fn empty_as_none<'de, D, T>(deserializer: D) -> Result<Option<BTreeSet<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Ord,
{
    Ok(Option::<BTreeSet<T>>::deserialize(deserializer)?.and_then(non_empty))
}

fn dimension_matches<T: Ord>(set: Option<&BTreeSet<T>>, value: Option<&T>) -> bool {
    match set {
        None => true,
        Some(set) => value.is_some_and(|value| set.contains(value)),
    }
}

/// Dimensions of one event, used to look up matching subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventKey<'a> {
    pub kind: EventKind,
    pub device_id: Option<&'a str>,
    pub network_id: Option<i64>,
    pub device_type_id: Option<i64>,
    pub name: Option<&'a str>,
}

impl<'a> EventKey<'a> {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            device_id: None,
            network_id: None,
            device_type_id: None,
            name: None,
        }
    }

    pub fn device(mut self, device_id: &'a str) -> Self {
        self.device_id = Some(device_id);
        self
    }

    pub fn network(mut self, network_id: i64) -> Self {
        self.network_id = Some(network_id);
        self
    }

    pub fn device_type(mut self, device_type_id: i64) -> Self {
        self.device_type_id = Some(device_type_id);
        self
    }

    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }
}

/// Identity of a live consumer: events are streamed to `reply_to` under
/// `correlation_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    pub id: SubscriptionId,
    pub reply_to: String,
    pub correlation_id: CorrelationId,
}

impl Subscriber {
    pub fn new(
        id: SubscriptionId,
        reply_to: impl Into<String>,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            id,
            reply_to: reply_to.into(),
            correlation_id,
        }
    }
}

/// Device as seen by cascading unregistration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type_id: Option<i64>,
}

impl DeviceRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            network_id: None,
            device_type_id: None,
        }
    }
}
