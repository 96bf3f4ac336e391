use courier_common::{EventKey, EventKind};
use courier_wire::BodyKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Device command, command update or notification routed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub kind: EventKind,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl BodyKind for DomainEvent {
    const CONTENT_TYPE: &'static str = "event";
}

impl DomainEvent {
    pub fn new(kind: EventKind, device_id: impl Into<String>) -> Self {
        Self {
            kind,
            device_id: device_id.into(),
            network_id: None,
            device_type_id: None,
            name: None,
            payload: Value::Null,
        }
    }

    pub fn with_network(mut self, network_id: i64) -> Self {
        self.network_id = Some(network_id);
        self
    }

    pub fn with_device_type(mut self, device_type_id: i64) -> Self {
        self.device_type_id = Some(device_type_id);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn key(&self) -> EventKey<'_> {
        EventKey {
            kind: self.kind,
            device_id: Some(&self.device_id),
            network_id: self.network_id,
            device_type_id: self.device_type_id,
            name: self.name.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_wire::Body;

    #[test]
    fn body_round_trip_keeps_dimensions() {
        let event = DomainEvent::new(EventKind::Notification, "D1")
            .with_network(3)
            .with_name("temp")
            .with_payload(serde_json::json!({ "value": 21 }));
        let body = Body::from_kind(&event).expect("encode");
        assert_eq!(body.content_type(), "event");
        let decoded: DomainEvent = body.decode_as().expect("decode");
        assert_eq!(decoded, event);

        let key = decoded.key();
        assert_eq!(key.device_id, Some("D1"));
        assert_eq!(key.network_id, Some(3));
        assert_eq!(key.device_type_id, None);
        assert_eq!(key.name, Some("temp"));
    }
}
