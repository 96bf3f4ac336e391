// Registry mutations broadcast between processes.
use bytes::Bytes;
use courier_common::ids::{InstanceId, SubscriptionId};
use courier_common::{DeviceRef, Filter, Subscriber};
use serde::{Deserialize, Serialize};

use crate::Result;

/// One registry mutation, stamped with the instance that produced it.
///
/// ```
/// use courier_common::ids::{InstanceId, SubscriptionId};
/// use courier_wire::{SubscriptionSyncMessage, SyncAction};
///
/// let message = SubscriptionSyncMessage::new(
///     InstanceId::new(),
///     SyncAction::Unregister { subscription_id: SubscriptionId::new() },
/// );
/// let decoded = SubscriptionSyncMessage::decode(&message.encode().expect("encode")).expect("decode");
/// assert_eq!(decoded, message);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSyncMessage {
    pub origin: InstanceId,
    #[serde(flatten)]
    pub action: SyncAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncAction {
    Register {
        filter: Filter,
        subscriber: Subscriber,
    },
    #[serde(rename_all = "camelCase")]
    Unregister { subscription_id: SubscriptionId },
    UnregisterDevice { device: DeviceRef },
    #[serde(rename_all = "camelCase")]
    UnregisterNetwork {
        network_id: i64,
        devices: Vec<DeviceRef>,
    },
    #[serde(rename_all = "camelCase")]
    UnregisterDeviceType {
        device_type_id: i64,
        devices: Vec<DeviceRef>,
    },
}

impl SyncAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "REGISTER",
            Self::Unregister { .. } => "UNREGISTER",
            Self::UnregisterDevice { .. } => "UNREGISTER_DEVICE",
            Self::UnregisterNetwork { .. } => "UNREGISTER_NETWORK",
            Self::UnregisterDeviceType { .. } => "UNREGISTER_DEVICE_TYPE",
        }
    }
}

impl SubscriptionSyncMessage {
    pub fn new(origin: InstanceId, action: SyncAction) -> Self {
        Self { origin, action }
    }

    pub fn encode(&self) -> Result<Bytes> {
        crate::to_bytes(self)
    }

    pub fn decode(input: &[u8]) -> Result<Self> {
        crate::from_slice(input)
    }
}
