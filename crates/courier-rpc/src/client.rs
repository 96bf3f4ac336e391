// RPC client: publishes requests and resolves their responses from the
// private reply topic.
use courier_broker::{Broker, OffsetReset, TopicProvisioner};
use courier_common::ids::CorrelationId;
use courier_wire::{Request, Response};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::RpcClientConfig;
use crate::executor::CallbackExecutor;
use crate::listener::run_response_listener;
use crate::matcher::{RequestResponseMatcher, ResponseCallback};
use crate::{Result, RpcError, response_topic};

/// Future resolving to the single response of a [`RpcClient::call`].
///
/// Dropping it does not cancel the call; use [`RpcClient::cancel`].
#[derive(Debug)]
pub struct PendingCall {
    correlation_id: CorrelationId,
    rx: oneshot::Receiver<Response>,
}

impl PendingCall {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }
}

impl Future for PendingCall {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(response)) => Poll::Ready(Ok(response)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::Cancelled(self.correlation_id.clone()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Request/response client over the broker.
///
/// `start` provisions the request and reply topics, joins the reply topic
/// with `reply_consumers` listeners and, unless disabled, pings until a server
/// answers.
pub struct RpcClient {
    broker: Arc<dyn Broker>,
    matcher: Arc<RequestResponseMatcher>,
    config: RpcClientConfig,
    reply_topic: String,
    shutdown_tx: watch::Sender<bool>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl RpcClient {
    pub async fn start(
        broker: Arc<dyn Broker>,
        provisioner: Arc<TopicProvisioner>,
        config: RpcClientConfig,
    ) -> Result<Self> {
        config.validate()?;
        let reply_topic = config
            .reply_topic
            .clone()
            .unwrap_or_else(|| response_topic(&courier_common::host_identity()));
        provisioner.ensure(&config.request_topic).await?;
        provisioner.ensure(&reply_topic).await?;

        let matcher = Arc::new(RequestResponseMatcher::new(CallbackExecutor::spawn()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Join the group with every listener before any of them polls so the
        // partition split is settled up front.
        let mut consumers = Vec::with_capacity(config.reply_consumers);
        for _ in 0..config.reply_consumers {
            consumers.push(
                broker
                    .subscribe(&reply_topic, &reply_topic, OffsetReset::Latest)
                    .await?,
            );
        }
        let listeners = consumers
            .into_iter()
            .map(|consumer| {
                tokio::spawn(run_response_listener(
                    consumer,
                    Arc::clone(&matcher),
                    shutdown_rx.clone(),
                    config.poll_timeout,
                ))
            })
            .collect();

        let client = Self {
            broker,
            matcher,
            config,
            reply_topic,
            shutdown_tx,
            listeners: Mutex::new(listeners),
        };
        tracing::info!(
            reply_topic = %client.reply_topic,
            request_topic = %client.config.request_topic,
            "rpc client started"
        );

        if let Err(err) = client.ping().await {
            client.shutdown().await;
            return Err(err);
        }
        Ok(client)
    }

    pub fn reply_topic(&self) -> &str {
        &self.reply_topic
    }

    pub fn matcher(&self) -> &Arc<RequestResponseMatcher> {
        &self.matcher
    }

    /// Publish `request` and return a future for its single response.
    ///
    /// Requests without a reply topic are routed to this client's own.
    pub async fn call(&self, request: Request) -> Result<PendingCall> {
        let request = request.or_reply_to(&self.reply_topic);
        let correlation_id = request.correlation_id().clone();
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let callback: ResponseCallback = Arc::new(move |response: Response| {
            if let Some(tx) = slot.lock().take() {
                let _ = tx.send(response);
            }
        });
        self.matcher
            .add_callback(correlation_id.clone(), callback, true)?;
        self.publish_registered(&request).await?;
        Ok(PendingCall { correlation_id, rx })
    }

    /// Streaming variant of [`call`](Self::call): `callback` sees every
    /// response until a terminal one.
    pub async fn call_with<F>(&self, request: Request, callback: F) -> Result<CorrelationId>
    where
        F: Fn(Response) + Send + Sync + 'static,
    {
        let request = request.or_reply_to(&self.reply_topic);
        let correlation_id = request.correlation_id().clone();
        self.matcher.add_callback(
            correlation_id.clone(),
            Arc::new(callback),
            request.single_reply(),
        )?;
        self.publish_registered(&request).await?;
        Ok(correlation_id)
    }

    /// Call with a caller-owned deadline; the callback is cancelled on expiry.
    pub async fn call_with_timeout(&self, request: Request, timeout: Duration) -> Result<Response> {
        let pending = self.call(request).await?;
        let correlation_id = pending.correlation_id().clone();
        match tokio::time::timeout(timeout, pending).await {
            Ok(result) => result,
            Err(_) => {
                self.cancel(&correlation_id);
                metrics::counter!("courier_rpc_call_timeouts_total").increment(1);
                Err(RpcError::Timeout {
                    correlation_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Fire-and-forget publish; no callback is registered.
    pub async fn push(&self, request: Request) -> Result<()> {
        self.publish(&request).await
    }

    pub fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        self.matcher.remove_callback(correlation_id)
    }

    // Publish after a callback was registered; a failed publish must not
    // leave the callback behind.
    async fn publish_registered(&self, request: &Request) -> Result<()> {
        if let Err(err) = self.publish(request).await {
            self.matcher.remove_callback(request.correlation_id());
            return Err(err);
        }
        Ok(())
    }

    async fn publish(&self, request: &Request) -> Result<()> {
        let payload = request.encode()?;
        self.broker
            .publish(&self.config.request_topic, request.partition_key(), payload)
            .await?;
        metrics::counter!("courier_rpc_requests_published_total").increment(1);
        tracing::trace!(
            correlation_id = %request.correlation_id(),
            partition_key = ?request.partition_key(),
            "request published"
        );
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let attempts = self.config.ping_attempts;
        for attempt in 1..=attempts {
            let ping = Request::ping(self.reply_topic.clone());
            match self.call_with_timeout(ping, self.config.ping_timeout).await {
                Ok(_) => {
                    tracing::info!(attempt, "rpc server reachable");
                    return Ok(());
                }
                Err(RpcError::Timeout { .. }) => {
                    tracing::warn!(attempt, attempts, "ping timed out");
                }
                Err(err) => return Err(err),
            }
        }
        if attempts == 0 {
            return Ok(());
        }
        Err(RpcError::ServerUnreachable { attempts })
    }

    /// Stop the reply listeners. Pending calls stay registered but will no
    /// longer be resolved.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            if let Err(err) = listener.await {
                tracing::warn!(error = %err, "response listener ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("reply_topic", &self.reply_topic)
            .field("config", &self.config)
            .field("matcher", &self.matcher)
            .finish_non_exhaustive()
    }
}
