// Registry replicated across processes through the sync topic.
use courier_broker::{Broker, Consumer, OffsetReset, TopicProvisioner};
use courier_common::ids::{InstanceId, SubscriptionId};
use courier_common::{DeviceRef, EventKey, Filter, Subscriber};
use courier_wire::{SubscriptionSyncMessage, SyncAction};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::EventBusConfig;
use crate::registry::FilterRegistry;
use crate::{Result, Subscription};

/// Local [`FilterRegistry`] kept in step with its peers.
///
/// Mutations apply locally, then go out on the sync topic stamped with this
/// instance's id. The listener applies every message from other instances
/// and skips its own.
pub struct DistributedFilterRegistry {
    local: Arc<FilterRegistry>,
    broker: Arc<dyn Broker>,
    instance_id: InstanceId,
    sync_topic: String,
    shutdown_tx: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl DistributedFilterRegistry {
    pub async fn start(
        local: Arc<FilterRegistry>,
        broker: Arc<dyn Broker>,
        provisioner: Arc<TopicProvisioner>,
        config: &EventBusConfig,
    ) -> Result<Arc<Self>> {
        provisioner
            .ensure_with(&config.sync_topic, config.sync_topic_config)
            .await?;
        // Joined before returning so no mutation published after start is missed.
        let consumer = broker
            .subscribe(&config.sync_topic, &config.sync_group(), OffsetReset::Latest)
            .await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = Arc::new(Self {
            local,
            broker,
            instance_id: config.instance_id,
            sync_topic: config.sync_topic.clone(),
            shutdown_tx,
            listener: Mutex::new(None),
        });
        let handle = tokio::spawn(run_sync_listener(
            consumer,
            Arc::clone(&registry),
            shutdown_rx,
            config.poll_timeout,
        ));
        *registry.listener.lock() = Some(handle);
        tracing::info!(
            instance_id = %registry.instance_id,
            sync_topic = %registry.sync_topic,
            "distributed registry started"
        );
        Ok(registry)
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn local(&self) -> &Arc<FilterRegistry> {
        &self.local
    }

    pub async fn register(&self, filter: Filter, subscriber: Subscriber) -> SubscriptionId {
        let id = self.local.register(filter.clone(), subscriber.clone());
        self.broadcast(SyncAction::Register { filter, subscriber })
            .await;
        id
    }

    pub async fn unregister(&self, subscription_id: SubscriptionId) -> bool {
        let removed = self.local.unregister(&subscription_id);
        self.broadcast(SyncAction::Unregister { subscription_id })
            .await;
        removed
    }

    pub async fn unregister_device(&self, device: DeviceRef) -> Vec<Subscriber> {
        let removed = self.local.unregister_device(&device);
        self.broadcast(SyncAction::UnregisterDevice { device }).await;
        removed
    }

    pub async fn unregister_network(
        &self,
        network_id: i64,
        devices: Vec<DeviceRef>,
    ) -> Vec<Subscriber> {
        let removed = self.local.unregister_network(network_id, &devices);
        self.broadcast(SyncAction::UnregisterNetwork {
            network_id,
            devices,
        })
        .await;
        removed
    }

    pub async fn unregister_device_type(
        &self,
        device_type_id: i64,
        devices: Vec<DeviceRef>,
    ) -> Vec<Subscriber> {
        let removed = self.local.unregister_device_type(device_type_id, &devices);
        self.broadcast(SyncAction::UnregisterDeviceType {
            device_type_id,
            devices,
        })
        .await;
        removed
    }

    pub fn match_event(&self, event: &EventKey<'_>) -> Vec<Subscription> {
        self.local.match_event(event)
    }

    /// Apply a message received from the sync topic. Returns false when the
    /// message originated here and was skipped.
    pub fn apply_remote(&self, message: SubscriptionSyncMessage) -> bool {
        if message.origin == self.instance_id {
            return false;
        }
        let action = message.action.name();
        match message.action {
            SyncAction::Register { filter, subscriber } => {
                self.local.register(filter, subscriber);
            }
            SyncAction::Unregister { subscription_id } => {
                self.local.unregister(&subscription_id);
            }
            SyncAction::UnregisterDevice { device } => {
                self.local.unregister_device(&device);
            }
            SyncAction::UnregisterNetwork {
                network_id,
                devices,
            } => {
                self.local.unregister_network(network_id, &devices);
            }
            SyncAction::UnregisterDeviceType {
                device_type_id,
                devices,
            } => {
                self.local.unregister_device_type(device_type_id, &devices);
            }
        }
        metrics::counter!("courier_sync_messages_applied_total", "action" => action).increment(1);
        tracing::debug!(origin = %message.origin, action, "applied remote registry change");
        true
    }

    /// Stop the sync listener. Local state stays readable.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.listener.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::warn!(error = %err, "sync listener ended abnormally");
        }
    }

    async fn broadcast(&self, action: SyncAction) {
        let name = action.name();
        let message = SubscriptionSyncMessage::new(self.instance_id, action);
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(action = name, error = %err, "failed to encode sync message");
                return;
            }
        };
        match self.broker.publish(&self.sync_topic, None, payload).await {
            Ok(_) => {
                metrics::counter!("courier_sync_messages_published_total", "action" => name)
                    .increment(1);
            }
            Err(err) => {
                metrics::counter!("courier_sync_publish_errors_total").increment(1);
                tracing::warn!(
                    topic = %self.sync_topic,
                    action = name,
                    error = %err,
                    "failed to publish sync message"
                );
            }
        }
    }
}

impl std::fmt::Debug for DistributedFilterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedFilterRegistry")
            .field("instance_id", &self.instance_id)
            .field("sync_topic", &self.sync_topic)
            .field("subscriptions", &self.local.len())
            .finish_non_exhaustive()
    }
}

async fn run_sync_listener(
    mut consumer: Box<dyn Consumer>,
    registry: Arc<DistributedFilterRegistry>,
    mut shutdown_rx: watch::Receiver<bool>,
    poll_timeout: Duration,
) {
    let topic = consumer.topic().to_string();
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let records = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            polled = consumer.poll(poll_timeout) => match polled {
                Ok(records) => records,
                Err(err) => {
                    tracing::warn!(topic = %topic, error = %err, "sync poll failed");
                    tokio::time::sleep(poll_timeout).await;
                    continue;
                }
            },
        };
        for record in records {
            match SubscriptionSyncMessage::decode(&record.payload) {
                Ok(message) => {
                    registry.apply_remote(message);
                }
                Err(err) => {
                    metrics::counter!("courier_sync_records_dropped_total").increment(1);
                    tracing::warn!(
                        topic = %record.topic,
                        offset = record.offset,
                        error = %err,
                        "dropping undecodable sync message"
                    );
                }
            }
        }
    }
    tracing::debug!(topic = %topic, "sync listener stopped");
}
