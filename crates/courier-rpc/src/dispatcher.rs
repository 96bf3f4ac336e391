use courier_broker::{Broker, RecordMetadata};
use courier_wire::Response;
use std::sync::Arc;

use crate::Result;

/// Publishes responses to reply topics.
///
/// Responses are keyed by correlation id so every chunk of a stream lands on
/// the same partition and is read back in order.
#[derive(Clone)]
pub struct ResponseDispatcher {
    broker: Arc<dyn Broker>,
}

impl ResponseDispatcher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    pub async fn send(&self, topic: &str, response: &Response) -> Result<RecordMetadata> {
        let payload = response.encode()?;
        let metadata = self
            .broker
            .publish(topic, Some(response.correlation_id().as_str()), payload)
            .await?;
        metrics::counter!("courier_rpc_responses_sent_total").increment(1);
        tracing::trace!(
            topic = %topic,
            correlation_id = %response.correlation_id(),
            last = response.is_last(),
            "response published"
        );
        Ok(metadata)
    }
}

impl std::fmt::Debug for ResponseDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseDispatcher").finish_non_exhaustive()
    }
}
