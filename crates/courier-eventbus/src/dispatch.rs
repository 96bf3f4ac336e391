// Client-side delivery of streamed events to local consumers.
use courier_common::ids::{CorrelationId, SubscriptionId};
use courier_rpc::RequestResponseMatcher;
use courier_rpc::matcher::ResponseCallback;
use courier_wire::{BodyKind, Response};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::event::DomainEvent;
use crate::Result;

/// Consumer of events arriving for one subscription.
pub trait DeliveryHandler: Send + Sync + 'static {
    /// Returns false when the event could not be handed over.
    fn deliver(&self, event: DomainEvent) -> bool;
}

/// Bounded per-session queue. Events beyond capacity are dropped with a
/// warning rather than blocking the callback executor.
#[derive(Debug, Clone)]
pub struct SessionQueue {
    tx: mpsc::Sender<DomainEvent>,
}

impl SessionQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DomainEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl DeliveryHandler for SessionQueue {
    fn deliver(&self, event: DomainEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                metrics::counter!("courier_events_dropped_total", "reason" => "full").increment(1);
                tracing::warn!(device_id = %event.device_id, "session queue full; dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Completes with the first delivered event; later events are refused.
#[derive(Debug)]
pub struct LongPoll {
    tx: Mutex<Option<oneshot::Sender<DomainEvent>>>,
}

impl LongPoll {
    pub fn new() -> (Self, oneshot::Receiver<DomainEvent>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

impl DeliveryHandler for LongPoll {
    fn deliver(&self, event: DomainEvent) -> bool {
        let tx = self.tx.lock().take();
        match tx {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

/// Route events streamed under `correlation_id` to `handler`.
///
/// The callback stays registered until a terminal response arrives or the
/// subscription link is removed.
pub fn attach_delivery(
    matcher: &RequestResponseMatcher,
    subscription_id: SubscriptionId,
    correlation_id: CorrelationId,
    handler: Arc<dyn DeliveryHandler>,
) -> Result<()> {
    let callback: ResponseCallback = Arc::new(move |response: Response| {
        if response.is_failed() {
            tracing::warn!(
                correlation_id = %response.correlation_id(),
                error_code = response.error_code(),
                "subscription stream failed"
            );
            return;
        }
        if response.is_last() && response.body().content_type() != DomainEvent::CONTENT_TYPE {
            tracing::debug!(correlation_id = %response.correlation_id(), "subscription stream closed");
            return;
        }
        match response.body().decode_as::<DomainEvent>() {
            Ok(event) => {
                handler.deliver(event);
            }
            Err(err) => {
                tracing::warn!(
                    correlation_id = %response.correlation_id(),
                    error = %err,
                    "dropping undecodable event"
                );
            }
        }
    });
    matcher
        .add_callback(correlation_id.clone(), callback, false)
        .map_err(courier_rpc::RpcError::from)?;
    matcher.add_subscription_link(subscription_id, correlation_id);
    Ok(())
}
