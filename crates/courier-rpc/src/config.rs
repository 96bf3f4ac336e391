// Client and server tuning knobs. Loading from the environment lives in the
// service; these structs only carry defaults and validation.
use courier_broker::OffsetReset;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::{REQUEST_CONSUMER_GROUP, REQUEST_TOPIC, RpcError};

const DEFAULT_REPLY_CONSUMERS: usize = 1;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;
const DEFAULT_PING_ATTEMPTS: u32 = 3;
const DEFAULT_PING_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_CONSUMER_THREADS: usize = 1;
const DEFAULT_WORKER_THREADS: usize = 4;
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// What a consumer does while the worker queue it targets is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStrategy {
    /// Park on the queue until a slot frees up.
    #[default]
    Blocking,
    /// Retry after yielding to the scheduler.
    Yielding,
    /// Retry after a short sleep.
    Sleeping,
}

impl FromStr for WaitStrategy {
    type Err = RpcError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "blocking" => Ok(Self::Blocking),
            "yielding" => Ok(Self::Yielding),
            "sleeping" => Ok(Self::Sleeping),
            other => Err(RpcError::InvalidConfig(format!("wait strategy {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcClientConfig {
    pub request_topic: String,
    /// Reply topic override; `None` derives `response_topic_<host identity>`.
    pub reply_topic: Option<String>,
    pub reply_consumers: usize,
    pub poll_timeout: Duration,
    /// Ping handshake attempts on start; zero skips the handshake.
    pub ping_attempts: u32,
    pub ping_timeout: Duration,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            request_topic: REQUEST_TOPIC.to_string(),
            reply_topic: None,
            reply_consumers: DEFAULT_REPLY_CONSUMERS,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            ping_attempts: DEFAULT_PING_ATTEMPTS,
            ping_timeout: Duration::from_millis(DEFAULT_PING_TIMEOUT_MS),
        }
    }
}

impl RpcClientConfig {
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.request_topic.is_empty() {
            return Err(RpcError::InvalidConfig("request topic is empty".into()));
        }
        if self.reply_consumers == 0 {
            return Err(RpcError::InvalidConfig("reply_consumers must be > 0".into()));
        }
        if self.poll_timeout.is_zero() {
            return Err(RpcError::InvalidConfig("poll_timeout must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcServerConfig {
    pub request_topic: String,
    pub consumer_group: String,
    pub consumer_threads: usize,
    pub worker_threads: usize,
    /// Capacity of each worker queue.
    pub buffer_size: usize,
    pub wait_strategy: WaitStrategy,
    pub poll_timeout: Duration,
    pub offset_reset: OffsetReset,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            request_topic: REQUEST_TOPIC.to_string(),
            consumer_group: REQUEST_CONSUMER_GROUP.to_string(),
            consumer_threads: DEFAULT_CONSUMER_THREADS,
            worker_threads: DEFAULT_WORKER_THREADS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            wait_strategy: WaitStrategy::default(),
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            offset_reset: OffsetReset::Earliest,
        }
    }
}

impl RpcServerConfig {
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.consumer_threads == 0 {
            return Err(RpcError::InvalidConfig("consumer_threads must be > 0".into()));
        }
        if self.worker_threads == 0 {
            return Err(RpcError::InvalidConfig("worker_threads must be > 0".into()));
        }
        if self.buffer_size == 0 {
            return Err(RpcError::InvalidConfig("buffer_size must be > 0".into()));
        }
        if self.poll_timeout.is_zero() {
            return Err(RpcError::InvalidConfig("poll_timeout must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_strategy_parses_case_insensitively() {
        assert_eq!("Sleeping".parse::<WaitStrategy>().expect("parse"), WaitStrategy::Sleeping);
        assert!("spinning".parse::<WaitStrategy>().is_err());
    }

    #[test]
    fn server_defaults_use_shared_group() {
        let config = RpcServerConfig::default();
        assert_eq!(config.consumer_group, "request_consumer_group");
        assert_eq!(config.request_topic, "request_topic");
        config.validate().expect("valid");
    }

    #[test]
    fn zero_workers_are_rejected() {
        let config = RpcServerConfig {
            worker_threads: 0,
            ..RpcServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(RpcError::InvalidConfig(_))));
    }
}
