// Subscription registry and event fan-out.
//
// `FilterRegistry` holds the local index, `DistributedFilterRegistry` keeps
// the indexes of every process in step through the sync topic, and `EventBus`
// streams matched events to subscribers' reply topics.
use courier_common::Filter;
use courier_common::Subscriber;
use courier_common::ids::SubscriptionId;

pub mod bus;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod distributed;
pub mod event;
pub mod registry;

pub use bus::EventBus;
pub use config::EventBusConfig;
pub use dispatch::{DeliveryHandler, LongPoll, SessionQueue, attach_delivery};
pub use distributed::DistributedFilterRegistry;
pub use event::DomainEvent;
pub use registry::FilterRegistry;

pub const SYNC_TOPIC: &str = "subscription_sync_topic";

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Broker(#[from] courier_broker::BrokerError),
    #[error(transparent)]
    Wire(#[from] courier_wire::Error),
    #[error(transparent)]
    Rpc(#[from] courier_rpc::RpcError),
}

/// A matched subscription: the subscriber plus the filter that matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub subscriber: Subscriber,
    pub filter: Filter,
}
