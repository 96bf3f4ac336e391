// In-process partitioned log broker.
// Each topic owns a fixed set of bounded partition logs plus consumer-group
// state; publishers wake pollers through a per-topic `Notify`.
use ahash::RandomState;
use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};

use crate::{
    Acks, Broker, BrokerError, BrokerSettings, Consumer, OffsetReset, Record, RecordMetadata,
    Result, TopicConfig, partition_for_key,
};

#[derive(Debug)]
struct LogEntry {
    offset: u64,
    key: Option<Arc<str>>,
    payload: Bytes,
}

#[derive(Debug, Default)]
struct PartitionLog {
    // Bounded log; oldest entries are dropped as new ones arrive.
    entries: VecDeque<LogEntry>,
    // Next offset to assign.
    next_offset: u64,
}

impl PartitionLog {
    fn append(&mut self, key: Option<&str>, payload: Bytes, capacity: usize) -> u64 {
        let offset = self.next_offset;
        self.next_offset += 1;
        self.entries.push_back(LogEntry {
            offset,
            key: key.map(Arc::from),
            payload,
        });
        let overflow = self.entries.len().saturating_sub(capacity);
        if overflow > 0 {
            self.entries.drain(..overflow);
            metrics::counter!("courier_broker_trimmed_total").increment(overflow as u64);
        }
        offset
    }

    fn oldest_offset(&self) -> u64 {
        self.entries
            .front()
            .map(|entry| entry.offset)
            .unwrap_or(self.next_offset)
    }
}

#[derive(Debug)]
struct GroupState {
    // Members in join order; partition `p` belongs to `members[p % len]`.
    members: Vec<u64>,
    // Next offset to deliver, per partition.
    positions: Vec<u64>,
    next_member_id: u64,
}

impl GroupState {
    fn assigned(&self, member_id: u64, partitions: usize) -> Vec<usize> {
        let Some(slot) = self.members.iter().position(|id| *id == member_id) else {
            return Vec::new();
        };
        let members = self.members.len();
        (0..partitions).filter(|p| p % members == slot).collect()
    }
}

#[derive(Debug)]
struct TopicState {
    name: Arc<str>,
    config: TopicConfig,
    partitions: Vec<Mutex<PartitionLog>>,
    groups: Mutex<HashMap<String, GroupState, RandomState>>,
    published: Notify,
    round_robin: AtomicUsize,
}

impl TopicState {
    fn new(name: &str, config: TopicConfig) -> Self {
        let partitions = (0..config.partitions)
            .map(|_| Mutex::new(PartitionLog::default()))
            .collect();
        Self {
            name: Arc::from(name),
            config,
            partitions,
            groups: Mutex::new(HashMap::with_hasher(RandomState::new())),
            published: Notify::new(),
            round_robin: AtomicUsize::new(0),
        }
    }

    fn pick_partition(&self, key: Option<&str>) -> u32 {
        match key {
            Some(key) => partition_for_key(key, self.config.partitions),
            None => {
                let next = self.round_robin.fetch_add(1, Ordering::Relaxed);
                (next % self.partitions.len()) as u32
            }
        }
    }

    fn join(&self, group: &str, reset: OffsetReset) -> u64 {
        let mut groups = self.groups.lock();
        let state = groups.entry(group.to_string()).or_insert_with(|| {
            // First member decides where the group starts reading.
            let positions = self
                .partitions
                .iter()
                .map(|log| {
                    let log = log.lock();
                    match reset {
                        OffsetReset::Earliest => log.oldest_offset(),
                        OffsetReset::Latest => log.next_offset,
                    }
                })
                .collect();
            GroupState {
                members: Vec::new(),
                positions,
                next_member_id: 0,
            }
        });
        let member_id = state.next_member_id;
        state.next_member_id += 1;
        state.members.push(member_id);
        tracing::debug!(
            topic = %self.name,
            group = %group,
            member_id,
            members = state.members.len(),
            "consumer joined group"
        );
        member_id
    }

    fn leave(&self, group: &str, member_id: u64) {
        let mut groups = self.groups.lock();
        if let Some(state) = groups.get_mut(group) {
            state.members.retain(|id| *id != member_id);
            tracing::debug!(
                topic = %self.name,
                group = %group,
                member_id,
                members = state.members.len(),
                "consumer left group"
            );
        }
        // Positions are kept so a later member resumes where the group stopped.
        drop(groups);
        // Remaining members pick up the released partitions on their next poll.
        self.published.notify_waiters();
    }

    fn fetch(&self, group: &str, member_id: u64, max_records: usize) -> Vec<Record> {
        let mut groups = self.groups.lock();
        let Some(state) = groups.get_mut(group) else {
            return Vec::new();
        };
        let mut records = Vec::new();
        for partition in state.assigned(member_id, self.partitions.len()) {
            if records.len() >= max_records {
                break;
            }
            let log = self.partitions[partition].lock();
            let position = &mut state.positions[partition];
            let oldest = log.oldest_offset();
            if *position < oldest {
                metrics::counter!("courier_broker_skipped_total").increment(oldest - *position);
                tracing::warn!(
                    topic = %self.name,
                    group = %group,
                    partition,
                    skipped = oldest - *position,
                    "consumer fell behind retention; skipping trimmed records"
                );
                *position = oldest;
            }
            let start = (*position - oldest) as usize;
            for entry in log.entries.iter().skip(start) {
                if records.len() >= max_records {
                    break;
                }
                records.push(Record {
                    topic: self.name.to_string(),
                    partition: partition as u32,
                    offset: entry.offset,
                    key: entry.key.as_deref().map(str::to_string),
                    payload: entry.payload.clone(),
                });
                // Auto-commit: the position moves as soon as the record is handed out.
                *position = entry.offset + 1;
            }
        }
        records
    }
}

/// In-process broker with Kafka-like topics, partitions and consumer groups.
///
/// ```
/// use bytes::Bytes;
/// use courier_broker::{Broker, InProcessBroker, OffsetReset, TopicConfig};
/// use std::time::Duration;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let broker = InProcessBroker::default();
///     broker
///         .create_topic("orders", TopicConfig::new(2, 1))
///         .await
///         .expect("create");
///     let mut consumer = broker
///         .subscribe("orders", "billing", OffsetReset::Earliest)
///         .await
///         .expect("subscribe");
///     broker
///         .publish("orders", Some("o-1"), Bytes::from_static(b"hello"))
///         .await
///         .expect("publish");
///     let records = consumer.poll(Duration::from_secs(1)).await.expect("poll");
///     assert_eq!(records[0].payload, Bytes::from_static(b"hello"));
/// });
/// ```
#[derive(Debug)]
pub struct InProcessBroker {
    topics: RwLock<HashMap<String, Arc<TopicState>, RandomState>>,
    settings: BrokerSettings,
}

impl Default for InProcessBroker {
    fn default() -> Self {
        Self {
            topics: RwLock::new(HashMap::with_hasher(RandomState::new())),
            settings: BrokerSettings::default(),
        }
    }
}

impl InProcessBroker {
    pub fn new(settings: BrokerSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            topics: RwLock::new(HashMap::with_hasher(RandomState::new())),
            settings,
        })
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    async fn topic(&self, name: &str) -> Result<Arc<TopicState>> {
        let topics = self.topics.read().await;
        topics
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::TopicNotFound(name.to_string()))
    }

    async fn append(&self, topic: &str, key: Option<&str>, payload: Bytes) -> Result<RecordMetadata> {
        let state = self.topic(topic).await?;
        let partition = state.pick_partition(key);
        let offset = state.partitions[partition as usize].lock().append(
            key,
            payload,
            self.settings.log_capacity,
        );
        state.published.notify_waiters();
        metrics::counter!("courier_broker_published_total").increment(1);
        Ok(RecordMetadata {
            partition,
            offset: Some(offset),
        })
    }
}

#[async_trait]
impl Broker for InProcessBroker {
    async fn create_topic(&self, name: &str, config: TopicConfig) -> Result<bool> {
        if config.partitions == 0 || config.replication_factor == 0 {
            return Err(BrokerError::InvalidTopicConfig {
                topic: name.to_string(),
                reason: "partitions and replication factor must be > 0".to_string(),
            });
        }
        let mut topics = self.topics.write().await;
        if topics.contains_key(name) {
            return Ok(false);
        }
        topics.insert(name.to_string(), Arc::new(TopicState::new(name, config)));
        tracing::info!(
            topic = %name,
            partitions = config.partitions,
            replication_factor = config.replication_factor,
            "topic created"
        );
        Ok(true)
    }

    async fn topic_exists(&self, name: &str) -> Result<bool> {
        Ok(self.topics.read().await.contains_key(name))
    }

    async fn partitions(&self, name: &str) -> Result<u32> {
        Ok(self.topic(name).await?.config.partitions)
    }

    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Bytes,
    ) -> Result<RecordMetadata> {
        match (self.append(topic, key, payload).await, self.settings.acks) {
            (Ok(metadata), Acks::None) => Ok(RecordMetadata {
                offset: None,
                ..metadata
            }),
            (Ok(metadata), _) => Ok(metadata),
            (Err(err), Acks::None) => {
                tracing::debug!(topic = %topic, error = %err, "unacknowledged publish failed");
                metrics::counter!("courier_broker_publish_errors_total").increment(1);
                Ok(RecordMetadata {
                    partition: 0,
                    offset: None,
                })
            }
            (Err(err), _) => {
                metrics::counter!("courier_broker_publish_errors_total").increment(1);
                Err(err)
            }
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        reset: OffsetReset,
    ) -> Result<Box<dyn Consumer>> {
        let state = self.topic(topic).await?;
        let member_id = state.join(group, reset);
        Ok(Box::new(InProcessConsumer {
            topic: state,
            group: group.to_string(),
            member_id,
            max_records: self.settings.max_poll_records,
        }))
    }
}

/// Group member handed out by [`InProcessBroker::subscribe`]; leaves the
/// group when dropped.
#[derive(Debug)]
pub struct InProcessConsumer {
    topic: Arc<TopicState>,
    group: String,
    member_id: u64,
    max_records: usize,
}

#[async_trait]
impl Consumer for InProcessConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<Record>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before reading so a concurrent publish is not missed.
            let notified = self.topic.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let records = self
                .topic
                .fetch(&self.group, self.member_id, self.max_records);
            if !records.is_empty() {
                return Ok(records);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    fn topic(&self) -> &str {
        &self.topic.name
    }

    fn group(&self) -> &str {
        &self.group
    }
}

impl Drop for InProcessConsumer {
    fn drop(&mut self) {
        self.topic.leave(&self.group, self.member_id);
    }
}
