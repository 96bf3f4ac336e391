// Partitioned pub/sub broker boundary used by the RPC shim and the registry.
// The shim only sees the `Broker` and `Consumer` traits; `InProcessBroker`
// implements them with bounded in-memory partition logs.
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

pub mod config;
pub mod memory;
pub mod provision;

pub use config::{Acks, BrokerSettings, OffsetReset, TopicConfig};
pub use memory::InProcessBroker;
pub use provision::TopicProvisioner;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("topic not found: {0}")]
    TopicNotFound(String),
    #[error("invalid topic config for {topic}: {reason}")]
    InvalidTopicConfig { topic: String, reason: String },
    #[error("invalid broker setting: {0}")]
    InvalidSetting(String),
}

/// Where a published record landed. `offset` is `None` when the producer
/// does not wait for acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMetadata {
    pub partition: u32,
    pub offset: Option<u64>,
}

/// A record handed out by [`Consumer::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    pub payload: Bytes,
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Create `name`; returns `false` when it already existed.
    async fn create_topic(&self, name: &str, config: TopicConfig) -> Result<bool>;

    async fn topic_exists(&self, name: &str) -> Result<bool>;

    async fn partitions(&self, name: &str) -> Result<u32>;

    /// Append `payload`; records sharing `key` land on the same partition.
    async fn publish(&self, topic: &str, key: Option<&str>, payload: Bytes)
    -> Result<RecordMetadata>;

    /// Join consumer group `group` on `topic`. `reset` applies only when the
    /// group has no committed position yet.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        reset: OffsetReset,
    ) -> Result<Box<dyn Consumer>>;
}

#[async_trait]
pub trait Consumer: Send {
    /// Wait up to `timeout` for records from the partitions assigned to this
    /// member. Returned positions are committed before the call returns.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<Record>>;

    fn topic(&self) -> &str;

    fn group(&self) -> &str;
}

/// Stable partition for `key`: XxHash64 (seed 0) modulo the partition count.
///
/// ```
/// let first = courier_broker::partition_for_key("device-1", 8);
/// assert_eq!(first, courier_broker::partition_for_key("device-1", 8));
/// assert!(first < 8);
/// ```
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    let hash = twox_hash::XxHash64::oneshot(0, key.as_bytes());
    (hash % u64::from(partitions.max(1))) as u32
}
