//! Courier node: an RPC server whose handler drives the distributed
//! subscription registry and the event bus.
//!
//! `Node::start` wires the pieces onto any [`Broker`]; the binary adds
//! configuration loading, observability and signal handling.
//!
//! The binary runs on [`courier_broker::InProcessBroker`], so every node and
//! client sharing a cluster lives in one process. `bootstrap_servers` and
//! `acks` are carried in [`courier_broker::BrokerSettings`] for a networked
//! `Broker` implementation; the in-process broker ignores them.
use anyhow::{Context, Result};
use courier_broker::{Broker, TopicProvisioner};
use courier_eventbus::{DistributedFilterRegistry, EventBus, FilterRegistry};
use courier_rpc::{ResponseDispatcher, RpcServer};
use std::sync::Arc;

pub mod config;
pub mod handler;

use config::NodeConfig;
use handler::NodeHandler;

pub struct Node {
    server: RpcServer,
    bus: EventBus,
}

impl Node {
    pub async fn start(broker: Arc<dyn Broker>, config: &NodeConfig) -> Result<Self> {
        let provisioner = Arc::new(TopicProvisioner::new(
            Arc::clone(&broker),
            config.topic_config(),
        ));
        let registry = DistributedFilterRegistry::start(
            Arc::new(FilterRegistry::new()),
            Arc::clone(&broker),
            Arc::clone(&provisioner),
            &config.event_bus_config(),
        )
        .await
        .context("start subscription registry")?;
        let bus = EventBus::new(registry, ResponseDispatcher::new(Arc::clone(&broker)));
        let handler = Arc::new(NodeHandler::new(bus.clone()));
        let server = RpcServer::start(broker, provisioner, handler, config.server_config())
            .await
            .context("start rpc server")?;
        tracing::info!(
            instance_id = %bus.registry().instance_id(),
            "node started"
        );
        Ok(Self { server, bus })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Stop consuming requests, drain the workers, then stop the sync listener.
    pub async fn shutdown(self) {
        self.server.shutdown().await;
        self.bus.registry().shutdown().await;
        tracing::info!("node stopped");
    }
}
