use anyhow::{Context, Result};
use courier_broker::{Acks, BrokerSettings, TopicConfig};
use courier_eventbus::EventBusConfig;
use courier_rpc::{RpcServerConfig, WaitStrategy};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

// Node service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Broker addresses, comma separated in the environment.
    pub bootstrap_servers: Vec<String>,
    pub acks: Acks,
    // Partitions / replication for topics created on demand.
    pub topic_partitions: u32,
    pub topic_replication: u16,
    // Request topic consumers in the server's group.
    pub consumer_threads: usize,
    pub worker_threads: usize,
    // Capacity of each worker queue.
    pub buffer_size: usize,
    pub wait_strategy: WaitStrategy,
    pub poll_timeout_ms: u64,
}

const DEFAULT_METRICS_BIND: &str = "0.0.0.0:9090";
const DEFAULT_BOOTSTRAP_SERVERS: &str = "localhost:9092";
const DEFAULT_TOPIC_PARTITIONS: u32 = 8;
const DEFAULT_TOPIC_REPLICATION: u16 = 1;
const DEFAULT_CONSUMER_THREADS: usize = 1;
const DEFAULT_WORKER_THREADS: usize = 4;
const DEFAULT_BUFFER_SIZE: usize = 1024;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;

#[derive(Debug, Deserialize)]
struct NodeConfigOverride {
    metrics_bind: Option<String>,
    bootstrap_servers: Option<Vec<String>>,
    acks: Option<String>,
    topic_partitions: Option<u32>,
    topic_replication: Option<u16>,
    consumer_threads: Option<usize>,
    worker_threads: Option<usize>,
    buffer_size: Option<usize>,
    wait_strategy: Option<String>,
    poll_timeout_ms: Option<u64>,
}

fn read_positive<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .filter(|value| *value > T::default())
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        let metrics_bind = std::env::var("COURIER_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse COURIER_METRICS_BIND")?;
        let bootstrap_servers = std::env::var("COURIER_BOOTSTRAP_SERVERS")
            .unwrap_or_else(|_| DEFAULT_BOOTSTRAP_SERVERS.to_string())
            .split(',')
            .map(str::trim)
            .filter(|server| !server.is_empty())
            .map(str::to_string)
            .collect();
        let acks = match std::env::var("COURIER_ACKS") {
            Ok(value) => value
                .parse::<Acks>()
                .with_context(|| "parse COURIER_ACKS")?,
            Err(_) => Acks::default(),
        };
        let wait_strategy = match std::env::var("COURIER_WAIT_STRATEGY") {
            Ok(value) => value
                .parse::<WaitStrategy>()
                .with_context(|| "parse COURIER_WAIT_STRATEGY")?,
            Err(_) => WaitStrategy::default(),
        };
        Ok(Self {
            metrics_bind,
            bootstrap_servers,
            acks,
            topic_partitions: read_positive("COURIER_TOPIC_PARTITIONS")
                .unwrap_or(DEFAULT_TOPIC_PARTITIONS),
            topic_replication: read_positive("COURIER_TOPIC_REPLICATION")
                .unwrap_or(DEFAULT_TOPIC_REPLICATION),
            consumer_threads: read_positive("COURIER_CONSUMER_THREADS")
                .unwrap_or(DEFAULT_CONSUMER_THREADS),
            worker_threads: read_positive("COURIER_WORKER_THREADS")
                .unwrap_or(DEFAULT_WORKER_THREADS),
            buffer_size: read_positive("COURIER_BUFFER_SIZE").unwrap_or(DEFAULT_BUFFER_SIZE),
            wait_strategy,
            poll_timeout_ms: read_positive("COURIER_POLL_TIMEOUT_MS")
                .unwrap_or(DEFAULT_POLL_TIMEOUT_MS),
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("COURIER_NODE_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read COURIER_NODE_CONFIG: {path}"))?;
            let override_cfg: NodeConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse node config yaml")?;
            override_cfg.apply(&mut config)?;
        }
        Ok(config)
    }

    pub fn topic_config(&self) -> TopicConfig {
        TopicConfig::new(self.topic_partitions, self.topic_replication)
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            bootstrap_servers: self.bootstrap_servers.clone(),
            acks: self.acks,
            topic: self.topic_config(),
            ..BrokerSettings::default()
        }
    }

    pub fn server_config(&self) -> RpcServerConfig {
        RpcServerConfig {
            consumer_threads: self.consumer_threads,
            worker_threads: self.worker_threads,
            buffer_size: self.buffer_size,
            wait_strategy: self.wait_strategy,
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            ..RpcServerConfig::default()
        }
    }

    pub fn event_bus_config(&self) -> EventBusConfig {
        EventBusConfig {
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            ..EventBusConfig::default()
        }
    }
}

impl NodeConfigOverride {
    fn apply(self, config: &mut NodeConfig) -> Result<()> {
        if let Some(value) = self.metrics_bind {
            config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = self.bootstrap_servers
            && !value.is_empty()
        {
            config.bootstrap_servers = value;
        }
        if let Some(value) = self.acks {
            config.acks = value.parse().with_context(|| "parse acks")?;
        }
        if let Some(value) = self.topic_partitions
            && value > 0
        {
            config.topic_partitions = value;
        }
        if let Some(value) = self.topic_replication
            && value > 0
        {
            config.topic_replication = value;
        }
        if let Some(value) = self.consumer_threads
            && value > 0
        {
            config.consumer_threads = value;
        }
        if let Some(value) = self.worker_threads
            && value > 0
        {
            config.worker_threads = value;
        }
        if let Some(value) = self.buffer_size
            && value > 0
        {
            config.buffer_size = value;
        }
        if let Some(value) = self.wait_strategy {
            config.wait_strategy = value.parse().with_context(|| "parse wait_strategy")?;
        }
        if let Some(value) = self.poll_timeout_ms
            && value > 0
        {
            config.poll_timeout_ms = value;
        }
        Ok(())
    }
}
