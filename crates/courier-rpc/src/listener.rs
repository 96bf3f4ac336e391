// Reply-topic consumer loop feeding the matcher.
use courier_broker::Consumer;
use courier_wire::Response;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::matcher::RequestResponseMatcher;

pub(crate) async fn run_response_listener(
    mut consumer: Box<dyn Consumer>,
    matcher: Arc<RequestResponseMatcher>,
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
                    tracing::warn!(topic = %topic, error = %err, "reply poll failed");
                    tokio::time::sleep(poll_timeout).await;
                    continue;
                }
            },
        };
        for record in records {
            match Response::decode(&record.payload) {
                Ok(response) => {
                    metrics::counter!("courier_rpc_responses_received_total").increment(1);
                    matcher.offer(response);
                }
                Err(err) => {
                    metrics::counter!("courier_rpc_records_dropped_total", "topic" => "reply")
                        .increment(1);
                    tracing::warn!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        error = %err,
                        "dropping undecodable response"
                    );
                }
            }
        }
    }
    tracing::debug!(topic = %topic, "response listener stopped");
}
