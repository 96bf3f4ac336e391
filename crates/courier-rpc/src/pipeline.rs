// Bounded worker pipeline between the request consumers and the handler.
//
// Each worker owns one bounded queue. Requests with a partition key always go
// to the same worker, so requests sharing a key are handled in the order they
// were consumed; key-less requests are spread round-robin.
use courier_wire::{Body, Request, Response};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::config::WaitStrategy;
use crate::dispatcher::ResponseDispatcher;
use crate::handler::{INTERNAL, RequestHandler};
use crate::{Result, RpcError};

const SLEEP_BACKOFF: Duration = Duration::from_millis(1);
pub(crate) const PONG_CONTENT_TYPE: &str = "pong";

pub(crate) struct Pipeline {
    queues: Vec<mpsc::Sender<Request>>,
    workers: Vec<JoinHandle<()>>,
    next: AtomicUsize,
    wait_strategy: WaitStrategy,
    depth: Arc<AtomicUsize>,
}

impl Pipeline {
    pub(crate) fn start(
        worker_threads: usize,
        buffer_size: usize,
        wait_strategy: WaitStrategy,
        handler: Arc<dyn RequestHandler>,
        dispatcher: ResponseDispatcher,
    ) -> Self {
        let depth = Arc::new(AtomicUsize::new(0));
        let mut queues = Vec::with_capacity(worker_threads);
        let mut workers = Vec::with_capacity(worker_threads);
        for worker in 0..worker_threads {
            let (tx, rx) = mpsc::channel(buffer_size);
            queues.push(tx);
            workers.push(tokio::spawn(run_worker(
                worker,
                rx,
                Arc::clone(&handler),
                dispatcher.clone(),
                Arc::clone(&depth),
            )));
        }
        Self {
            queues,
            workers,
            next: AtomicUsize::new(0),
            wait_strategy,
            depth,
        }
    }

    fn route(&self, request: &Request) -> usize {
        match request.partition_key() {
            Some(key) => courier_broker::partition_for_key(key, self.queues.len() as u32) as usize,
            None => self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len(),
        }
    }

    /// Queue `request`, waiting according to the wait strategy while the
    /// target worker is full.
    pub(crate) async fn submit(&self, request: Request) -> Result<()> {
        let queue = &self.queues[self.route(&request)];
        match self.wait_strategy {
            WaitStrategy::Blocking => queue
                .send(request)
                .await
                .map_err(|_| RpcError::PipelineClosed)?,
            WaitStrategy::Yielding | WaitStrategy::Sleeping => {
                let mut pending = request;
                loop {
                    match queue.try_send(pending) {
                        Ok(()) => break,
                        Err(TrySendError::Closed(_)) => return Err(RpcError::PipelineClosed),
                        Err(TrySendError::Full(request)) => {
                            pending = request;
                            if self.wait_strategy == WaitStrategy::Yielding {
                                tokio::task::yield_now().await;
                            } else {
                                tokio::time::sleep(SLEEP_BACKOFF).await;
                            }
                        }
                    }
                }
            }
        }
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("courier_rpc_pipeline_depth").set(depth as f64);
        Ok(())
    }

    /// Close the queues and wait for workers to drain what was already queued.
    pub(crate) async fn shutdown(self) {
        drop(self.queues);
        for worker in self.workers {
            if let Err(err) = worker.await {
                tracing::warn!(error = %err, "pipeline worker ended abnormally");
            }
        }
    }
}

async fn run_worker(
    worker: usize,
    mut rx: mpsc::Receiver<Request>,
    handler: Arc<dyn RequestHandler>,
    dispatcher: ResponseDispatcher,
    depth: Arc<AtomicUsize>,
) {
    while let Some(request) = rx.recv().await {
        let _ = depth.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        let response = process(handler.as_ref(), &request).await;
        let Some(reply_to) = request.reply_to() else {
            tracing::debug!(
                correlation_id = %request.correlation_id(),
                "no reply topic; dropping response"
            );
            continue;
        };
        if let Err(err) = dispatcher.send(reply_to, &response).await {
            tracing::warn!(
                worker,
                topic = %reply_to,
                correlation_id = %request.correlation_id(),
                error = %err,
                "failed to publish response"
            );
        }
    }
    tracing::debug!(worker, "pipeline worker stopped");
}

/// Run the handler for one request; never panics and always returns a
/// response addressed to the request's correlation id.
pub(crate) async fn process(handler: &dyn RequestHandler, request: &Request) -> Response {
    let correlation_id = request.correlation_id().clone();
    if request.is_ping() {
        return Response::ok(correlation_id, Body::empty(PONG_CONTENT_TYPE));
    }
    metrics::counter!("courier_rpc_requests_handled_total").increment(1);
    match AssertUnwindSafe(handler.handle(request)).catch_unwind().await {
        Ok(Ok(response)) => response.readdress(correlation_id),
        Ok(Err(err)) => {
            metrics::counter!("courier_rpc_handler_errors_total").increment(1);
            tracing::debug!(correlation_id = %correlation_id, error = %err, "handler failed");
            err.into_response(request)
        }
        Err(panic) => {
            metrics::counter!("courier_rpc_handler_panics_total").increment(1);
            let message = panic_message(panic.as_ref());
            tracing::error!(correlation_id = %correlation_id, panic = %message, "handler panicked");
            Response::failure(correlation_id, INTERNAL, format!("handler panicked: {message}"))
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
