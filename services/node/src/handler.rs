// Request handler wiring subscription commands and events to the bus.
use async_trait::async_trait;
use courier_common::Subscriber;
use courier_common::ids::{CorrelationId, SubscriptionId};
use courier_eventbus::command::{
    CascadeAck, DeviceRemoved, DeviceTypeRemoved, NetworkRemoved, Published, SubscribeAck,
    SubscribeCommand, UnsubscribeAck, UnsubscribeCommand,
};
use courier_eventbus::{DomainEvent, EventBus};
use courier_rpc::{HandlerError, RequestHandler};
use courier_wire::{Body, BodyKind, BodyRegistry, Request, Response};
use serde::Serialize;

#[derive(Debug)]
enum NodeCommand {
    Subscribe(SubscribeCommand),
    Unsubscribe(UnsubscribeCommand),
    Publish(DomainEvent),
    DeviceRemoved(DeviceRemoved),
    NetworkRemoved(NetworkRemoved),
    DeviceTypeRemoved(DeviceTypeRemoved),
}

pub struct NodeHandler {
    bus: EventBus,
    bodies: BodyRegistry<NodeCommand>,
}

impl NodeHandler {
    pub fn new(bus: EventBus) -> Self {
        let bodies = BodyRegistry::new()
            .register(NodeCommand::Subscribe)
            .register(NodeCommand::Unsubscribe)
            .register(NodeCommand::Publish)
            .register(NodeCommand::DeviceRemoved)
            .register(NodeCommand::NetworkRemoved)
            .register(NodeCommand::DeviceTypeRemoved);
        Self { bus, bodies }
    }

    async fn subscribe(
        &self,
        request: &Request,
        command: SubscribeCommand,
    ) -> Result<SubscribeAck, HandlerError> {
        if command.filters.is_empty() {
            return Err(HandlerError::BadRequest("subscribe needs at least one filter".into()));
        }
        let reply_to = request
            .reply_to()
            .ok_or_else(|| HandlerError::BadRequest("subscribe needs a reply topic".into()))?;
        let subscriber = Subscriber::new(
            command.subscription_id.unwrap_or_default(),
            reply_to,
            command.correlation_id.unwrap_or_else(CorrelationId::new),
        );
        let ack = SubscribeAck {
            subscription_id: subscriber.id,
            correlation_id: subscriber.correlation_id.clone(),
        };
        self.bus.subscribe(command.filters, subscriber).await;
        Ok(ack)
    }

    async fn unsubscribe(&self, subscription_id: SubscriptionId) -> UnsubscribeAck {
        let removed = self.bus.unsubscribe(subscription_id).await;
        UnsubscribeAck {
            subscription_id,
            removed,
        }
    }
}

fn reply<T: BodyKind + Serialize>(request: &Request, payload: &T) -> Result<Response, HandlerError> {
    let body = Body::from_kind(payload).map_err(|err| HandlerError::Internal(err.into()))?;
    Ok(Response::ok(request.correlation_id().clone(), body))
}

#[async_trait]
impl RequestHandler for NodeHandler {
    async fn handle(&self, request: &Request) -> Result<Response, HandlerError> {
        let command = self
            .bodies
            .decode(request.body())
            .map_err(|err| HandlerError::BadRequest(err.to_string()))?;
        match command {
            NodeCommand::Subscribe(command) => {
                let ack = self.subscribe(request, command).await?;
                reply(request, &ack)
            }
            NodeCommand::Unsubscribe(command) => {
                let ack = self.unsubscribe(command.subscription_id).await;
                reply(request, &ack)
            }
            NodeCommand::Publish(event) => {
                let delivered = self
                    .bus
                    .publish(&event)
                    .await
                    .map_err(|err| HandlerError::Internal(err.into()))?;
                reply(request, &Published { delivered })
            }
            NodeCommand::DeviceRemoved(command) => {
                let removed = self.bus.unregister_device(command.device).await;
                reply(request, &CascadeAck { removed })
            }
            NodeCommand::NetworkRemoved(command) => {
                let removed = self
                    .bus
                    .unregister_network(command.network_id, command.devices)
                    .await;
                reply(request, &CascadeAck { removed })
            }
            NodeCommand::DeviceTypeRemoved(command) => {
                let removed = self
                    .bus
                    .unregister_device_type(command.device_type_id, command.devices)
                    .await;
                reply(request, &CascadeAck { removed })
            }
        }
    }
}
