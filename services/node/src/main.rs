// Node service main entry point.
mod observability;

use anyhow::{Context, Result};
use courier_broker::{Broker, InProcessBroker};
use node::config::NodeConfig;
use node::Node;
use std::future::Future;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("courier-node")?;
    let config = NodeConfig::from_env_or_yaml()?;

    let broker: Arc<dyn Broker> = Arc::new(
        InProcessBroker::new(config.broker_settings()).context("build broker")?,
    );
    tracing::info!(
        bootstrap_servers = ?config.bootstrap_servers,
        acks = ?config.acks,
        "in-process broker ready"
    );

    let metrics_task = tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));
    let node = Node::start(broker, &config).await?;

    shutdown.await;
    node.shutdown().await;
    metrics_task.abort();
    Ok(())
}
