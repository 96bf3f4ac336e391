use courier_broker::TopicConfig;
use courier_common::ids::InstanceId;
use std::time::Duration;

use crate::SYNC_TOPIC;

const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBusConfig {
    /// Identity stamped on outgoing sync messages; messages carrying it are
    /// skipped by this process's listener.
    pub instance_id: InstanceId,
    pub sync_topic: String,
    // A single partition keeps every process applying mutations in one order.
    pub sync_topic_config: TopicConfig,
    pub poll_timeout: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            instance_id: InstanceId::new(),
            sync_topic: SYNC_TOPIC.to_string(),
            sync_topic_config: TopicConfig::new(1, 1),
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
        }
    }
}

impl EventBusConfig {
    /// Consumer group of this process on the sync topic; unique per process so
    /// every process sees every message.
    pub fn sync_group(&self) -> String {
        format!("sync-{}", self.instance_id)
    }
}
