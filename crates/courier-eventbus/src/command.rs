// Request bodies understood by the subscription handler.
use courier_common::{DeviceRef, Filter};
use courier_common::ids::{CorrelationId, SubscriptionId};
use courier_wire::BodyKind;
use serde::{Deserialize, Serialize};

/// Start streaming events matching any of `filters`.
///
/// Ids left out are generated by the node and returned in the ack; callers
/// that attach delivery before subscribing supply their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeCommand {
    pub filters: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<SubscriptionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl BodyKind for SubscribeCommand {
    const CONTENT_TYPE: &'static str = "subscribe";
}

/// Ids the event stream runs under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeAck {
    pub subscription_id: SubscriptionId,
    pub correlation_id: CorrelationId,
}

impl BodyKind for SubscribeAck {
    const CONTENT_TYPE: &'static str = "subscribed";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeCommand {
    pub subscription_id: SubscriptionId,
}

impl BodyKind for UnsubscribeCommand {
    const CONTENT_TYPE: &'static str = "unsubscribe";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeAck {
    pub subscription_id: SubscriptionId,
    pub removed: bool,
}

impl BodyKind for UnsubscribeAck {
    const CONTENT_TYPE: &'static str = "unsubscribed";
}

/// Number of subscribers an event was streamed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Published {
    pub delivered: usize,
}

impl BodyKind for Published {
    const CONTENT_TYPE: &'static str = "published";
}

/// Device deleted, or moved out from under the subscriptions naming it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRemoved {
    pub device: DeviceRef,
}

impl BodyKind for DeviceRemoved {
    const CONTENT_TYPE: &'static str = "device_removed";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRemoved {
    pub network_id: i64,
    #[serde(default)]
    pub devices: Vec<DeviceRef>,
}

impl BodyKind for NetworkRemoved {
    const CONTENT_TYPE: &'static str = "network_removed";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTypeRemoved {
    pub device_type_id: i64,
    #[serde(default)]
    pub devices: Vec<DeviceRef>,
}

impl BodyKind for DeviceTypeRemoved {
    const CONTENT_TYPE: &'static str = "device_type_removed";
}

/// Subscriptions a cascading removal closed on this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeAck {
    pub removed: Vec<SubscriptionId>,
}

impl BodyKind for CascadeAck {
    const CONTENT_TYPE: &'static str = "cascaded";
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::EventKind;
    use courier_wire::Body;

    #[test]
    fn subscribe_command_uses_camel_case() {
        let command = SubscribeCommand {
            filters: vec![Filter::new(EventKind::Command).with_devices(["D1"])],
            subscription_id: None,
            correlation_id: Some(CorrelationId::from("c-1")),
        };
        let body = Body::from_kind(&command).expect("body");
        assert_eq!(body.content_type(), "subscribe");
        assert_eq!(body.value()["correlationId"], "c-1");
        assert_eq!(body.value()["filters"][0]["deviceIds"][0], "D1");
        assert!(body.value().get("subscriptionId").is_none());
        assert_eq!(body.decode_as::<SubscribeCommand>().expect("decode"), command);
    }

    #[test]
    fn network_removed_defaults_to_no_devices() {
        let body = Body::from_kind(&NetworkRemoved {
            network_id: 3,
            devices: vec![DeviceRef::new("D1")],
        })
        .expect("body");
        assert_eq!(body.content_type(), "network_removed");
        assert_eq!(body.value()["networkId"], 3);
        assert_eq!(body.value()["devices"][0]["id"], "D1");

        let bare: NetworkRemoved = serde_json::from_value(serde_json::json!({ "networkId": 9 }))
            .expect("decode");
        assert!(bare.devices.is_empty());
    }

    #[test]
    fn decode_rejects_mismatched_content_type() {
        let body = Body::from_kind(&Published { delivered: 2 }).expect("body");
        assert!(body.decode_as::<SubscribeAck>().is_err());
    }
}
