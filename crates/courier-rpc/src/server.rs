// RPC server: request-topic consumers feeding the worker pipeline.
use courier_broker::{Broker, Consumer, TopicProvisioner};
use courier_wire::Request;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::RpcServerConfig;
use crate::dispatcher::ResponseDispatcher;
use crate::handler::RequestHandler;
use crate::pipeline::Pipeline;
use crate::{Result, RpcError};

/// Consumes the request topic in a consumer group and answers each request
/// on its reply topic.
///
/// When the pipeline is full, consumers stop polling until a slot frees up;
/// there is no load shedding.
pub struct RpcServer {
    config: RpcServerConfig,
    dispatcher: ResponseDispatcher,
    shutdown_tx: watch::Sender<bool>,
    consumers: Vec<JoinHandle<()>>,
    pipeline: Arc<Pipeline>,
}

impl RpcServer {
    pub async fn start(
        broker: Arc<dyn Broker>,
        provisioner: Arc<TopicProvisioner>,
        handler: Arc<dyn RequestHandler>,
        config: RpcServerConfig,
    ) -> Result<Self> {
        config.validate()?;
        provisioner.ensure(&config.request_topic).await?;

        let dispatcher = ResponseDispatcher::new(Arc::clone(&broker));
        let pipeline = Arc::new(Pipeline::start(
            config.worker_threads,
            config.buffer_size,
            config.wait_strategy,
            handler,
            dispatcher.clone(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Everyone joins before anyone polls so no partition changes hands
        // while requests are in flight.
        let mut members = Vec::with_capacity(config.consumer_threads);
        for _ in 0..config.consumer_threads {
            members.push(
                broker
                    .subscribe(
                        &config.request_topic,
                        &config.consumer_group,
                        config.offset_reset,
                    )
                    .await?,
            );
        }
        let consumers = members
            .into_iter()
            .enumerate()
            .map(|(index, consumer)| {
                tokio::spawn(run_request_consumer(
                    index,
                    consumer,
                    Arc::clone(&pipeline),
                    shutdown_rx.clone(),
                    config.poll_timeout,
                ))
            })
            .collect();

        tracing::info!(
            request_topic = %config.request_topic,
            consumer_group = %config.consumer_group,
            consumer_threads = config.consumer_threads,
            worker_threads = config.worker_threads,
            buffer_size = config.buffer_size,
            wait_strategy = ?config.wait_strategy,
            "rpc server started"
        );
        Ok(Self {
            config,
            dispatcher,
            shutdown_tx,
            consumers,
            pipeline,
        })
    }

    /// Dispatcher publishing to reply topics; handlers use it to stream
    /// additional responses.
    pub fn dispatcher(&self) -> &ResponseDispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &RpcServerConfig {
        &self.config
    }

    /// Stop consuming, then let the workers finish everything already queued.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for consumer in self.consumers {
            if let Err(err) = consumer.await {
                tracing::warn!(error = %err, "request consumer ended abnormally");
            }
        }
        match Arc::try_unwrap(self.pipeline) {
            Ok(pipeline) => pipeline.shutdown().await,
            Err(_) => tracing::warn!("pipeline still referenced; workers left running"),
        }
        tracing::info!("rpc server stopped");
    }
}

async fn run_request_consumer(
    index: usize,
    mut consumer: Box<dyn Consumer>,
    pipeline: Arc<Pipeline>,
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
                    tracing::warn!(consumer = index, topic = %topic, error = %err, "request poll failed");
                    tokio::time::sleep(poll_timeout).await;
                    continue;
                }
            },
        };
        for record in records {
            let request = match Request::decode(&record.payload) {
                Ok(request) => request,
                Err(err) => {
                    metrics::counter!("courier_rpc_records_dropped_total", "topic" => "request")
                        .increment(1);
                    tracing::warn!(
                        consumer = index,
                        partition = record.partition,
                        offset = record.offset,
                        error = %err,
                        "dropping undecodable request"
                    );
                    continue;
                }
            };
            metrics::counter!("courier_rpc_requests_received_total").increment(1);
            // Blocks while the target worker is full.
            if let Err(RpcError::PipelineClosed) = pipeline.submit(request).await {
                tracing::warn!(consumer = index, "pipeline closed; stopping consumer");
                return;
            }
        }
    }
    tracing::debug!(consumer = index, topic = %topic, "request consumer stopped");
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("config", &self.config)
            .field("consumers", &self.consumers.len())
            .finish_non_exhaustive()
    }
}
