// Event fan-out to matched subscribers.
use courier_common::ids::SubscriptionId;
use courier_common::{DeviceRef, Filter, Subscriber};
use courier_rpc::ResponseDispatcher;
use courier_wire::{Body, Response};
use std::sync::Arc;

use crate::command::UnsubscribeAck;
use crate::distributed::DistributedFilterRegistry;
use crate::event::DomainEvent;
use crate::Result;

/// Streams events to the reply topics of matching subscribers.
///
/// Each delivery is a non-terminal [`Response`] carrying the subscriber's
/// correlation id; the stream is closed with a terminal response when the
/// subscription is removed through [`EventBus::unsubscribe`] or one of the
/// cascading removals.
#[derive(Debug, Clone)]
pub struct EventBus {
    registry: Arc<DistributedFilterRegistry>,
    dispatcher: ResponseDispatcher,
}

impl EventBus {
    pub fn new(registry: Arc<DistributedFilterRegistry>, dispatcher: ResponseDispatcher) -> Self {
        Self {
            registry,
            dispatcher,
        }
    }

    pub fn registry(&self) -> &Arc<DistributedFilterRegistry> {
        &self.registry
    }

    /// Register every filter under `subscriber.id`.
    pub async fn subscribe(&self, filters: Vec<Filter>, subscriber: Subscriber) -> SubscriptionId {
        let id = subscriber.id;
        for filter in filters {
            self.registry.register(filter, subscriber.clone()).await;
        }
        tracing::info!(
            subscription_id = %id,
            reply_to = %subscriber.reply_to,
            correlation_id = %subscriber.correlation_id,
            "subscription registered"
        );
        id
    }

    /// Remove the subscription and close its stream. Returns false when this
    /// process did not know the subscription.
    pub async fn unsubscribe(&self, subscription_id: SubscriptionId) -> bool {
        let subscriber = self.registry.local().subscriber(&subscription_id);
        let removed = self.registry.unregister(subscription_id).await;
        if let Some(subscriber) = subscriber {
            self.close_stream(&subscriber, removed).await;
        }
        removed
    }

    /// Drop every subscription referencing the deleted device and close
    /// their streams.
    pub async fn unregister_device(&self, device: DeviceRef) -> Vec<SubscriptionId> {
        let removed = self.registry.unregister_device(device).await;
        self.close_streams(removed).await
    }

    pub async fn unregister_network(
        &self,
        network_id: i64,
        devices: Vec<DeviceRef>,
    ) -> Vec<SubscriptionId> {
        let removed = self.registry.unregister_network(network_id, devices).await;
        self.close_streams(removed).await
    }

    pub async fn unregister_device_type(
        &self,
        device_type_id: i64,
        devices: Vec<DeviceRef>,
    ) -> Vec<SubscriptionId> {
        let removed = self
            .registry
            .unregister_device_type(device_type_id, devices)
            .await;
        self.close_streams(removed).await
    }

    async fn close_streams(&self, subscribers: Vec<Subscriber>) -> Vec<SubscriptionId> {
        let mut ids = Vec::with_capacity(subscribers.len());
        for subscriber in subscribers {
            self.close_stream(&subscriber, true).await;
            ids.push(subscriber.id);
        }
        if !ids.is_empty() {
            tracing::info!(removed = ids.len(), "cascade closed subscriptions");
        }
        ids
    }

    // Terminal response: the client's delivery callback is released on receipt.
    async fn close_stream(&self, subscriber: &Subscriber, removed: bool) {
        let ack = UnsubscribeAck {
            subscription_id: subscriber.id,
            removed,
        };
        let body = match Body::from_kind(&ack) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode unsubscribe ack");
                return;
            }
        };
        let close = Response::ok(subscriber.correlation_id.clone(), body);
        if let Err(err) = self.dispatcher.send(&subscriber.reply_to, &close).await {
            tracing::warn!(
                subscription_id = %subscriber.id,
                topic = %subscriber.reply_to,
                error = %err,
                "failed to close subscription stream"
            );
        }
    }

    /// Stream `event` to every matching subscriber. Returns how many
    /// deliveries were published; individual failures are logged.
    pub async fn publish(&self, event: &DomainEvent) -> Result<usize> {
        let body = Body::from_kind(event)?;
        let matched = self.registry.match_event(&event.key());
        let mut delivered = 0;
        for subscription in matched {
            let subscriber = subscription.subscriber;
            let response = Response::chunk(subscriber.correlation_id.clone(), body.clone());
            match self.dispatcher.send(&subscriber.reply_to, &response).await {
                Ok(_) => delivered += 1,
                Err(err) => {
                    metrics::counter!("courier_events_dropped_total", "reason" => "publish")
                        .increment(1);
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        topic = %subscriber.reply_to,
                        error = %err,
                        "failed to deliver event"
                    );
                }
            }
        }
        metrics::counter!("courier_events_published_total").increment(1);
        metrics::counter!("courier_events_delivered_total").increment(delivered as u64);
        tracing::debug!(
            kind = event.kind.as_str(),
            device_id = %event.device_id,
            delivered,
            "event published"
        );
        Ok(delivered)
    }
}
