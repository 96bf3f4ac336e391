use dashmap::DashSet;
use std::sync::Arc;

use crate::{Broker, Result, TopicConfig};

/// Makes sure topics exist before anyone publishes or subscribes.
///
/// Topics confirmed once are cached, so repeated `ensure` calls for the same
/// name do not go back to the broker.
pub struct TopicProvisioner {
    broker: Arc<dyn Broker>,
    defaults: TopicConfig,
    known: DashSet<String>,
}

impl TopicProvisioner {
    pub fn new(broker: Arc<dyn Broker>, defaults: TopicConfig) -> Self {
        Self {
            broker,
            defaults,
            known: DashSet::new(),
        }
    }

    pub fn defaults(&self) -> TopicConfig {
        self.defaults
    }

    pub async fn ensure(&self, name: &str) -> Result<()> {
        self.ensure_with(name, self.defaults).await
    }

    pub async fn ensure_with(&self, name: &str, config: TopicConfig) -> Result<()> {
        if self.known.contains(name) {
            return Ok(());
        }
        // Two callers may race to create the topic; the broker reports the
        // loser as "already exists", which is fine.
        let created = self.broker.create_topic(name, config).await?;
        if created {
            metrics::counter!("courier_topics_created_total").increment(1);
        } else {
            tracing::debug!(topic = %name, "topic already exists");
        }
        self.known.insert(name.to_string());
        Ok(())
    }
}

impl std::fmt::Debug for TopicProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicProvisioner")
            .field("defaults", &self.defaults)
            .field("known", &self.known.len())
            .finish()
    }
}
