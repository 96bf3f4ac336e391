use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::BrokerError;

const DEFAULT_PARTITIONS: u32 = 8;
const DEFAULT_REPLICATION_FACTOR: u16 = 1;
const DEFAULT_LOG_CAPACITY: usize = 64 * 1024;
const DEFAULT_MAX_POLL_RECORDS: usize = 500;

/// Producer acknowledgement level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acks {
    /// Fire and forget: publish errors are logged and swallowed.
    None,
    #[default]
    Leader,
    All,
}

impl FromStr for Acks {
    type Err = BrokerError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "none" | "0" => Ok(Self::None),
            "leader" | "1" => Ok(Self::Leader),
            "all" | "-1" => Ok(Self::All),
            other => Err(BrokerError::InvalidSetting(format!("acks={other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    Earliest,
    #[default]
    Latest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub partitions: u32,
    pub replication_factor: u16,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            partitions: DEFAULT_PARTITIONS,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
        }
    }
}

impl TopicConfig {
    pub fn new(partitions: u32, replication_factor: u16) -> Self {
        Self {
            partitions,
            replication_factor,
        }
    }
}

/// Connection and producer/consumer settings shared by every component
/// talking to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub bootstrap_servers: Vec<String>,
    pub acks: Acks,
    pub topic: TopicConfig,
    // Per-partition retention of the in-process log.
    pub log_capacity: usize,
    pub max_poll_records: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            bootstrap_servers: vec!["localhost:9092".to_string()],
            acks: Acks::default(),
            topic: TopicConfig::default(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            max_poll_records: DEFAULT_MAX_POLL_RECORDS,
        }
    }
}

impl BrokerSettings {
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.topic.partitions == 0 {
            return Err(BrokerError::InvalidSetting("partitions must be > 0".into()));
        }
        if self.topic.replication_factor == 0 {
            return Err(BrokerError::InvalidSetting(
                "replication factor must be > 0".into(),
            ));
        }
        if self.log_capacity == 0 {
            return Err(BrokerError::InvalidSetting("log capacity must be > 0".into()));
        }
        if self.max_poll_records == 0 {
            return Err(BrokerError::InvalidSetting(
                "max poll records must be > 0".into(),
            ));
        }
        Ok(())
    }
}
