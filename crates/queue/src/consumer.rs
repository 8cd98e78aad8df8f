//! Consumer-side sub-queue multiplexing.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{ConsumeError, Envelope, QueueError};

/// A logical consumer of one sub-queue.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Processes the inner payload of one envelope.
    ///
    /// An error leaves the message unacknowledged.
    async fn consume_message(&self, payload: serde_json::Value) -> Result<(), ConsumeError>;
}

/// Routes raw messages from one physical queue to their registered
/// [`Consumer`] by sub-queue id.
#[derive(Default)]
pub struct ConsumerMultiplexer {
    consumers: BTreeMap<String, Arc<dyn Consumer>>,
}

impl ConsumerMultiplexer {
    /// Creates an empty multiplexer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the consumer for a sub-queue. Each id takes exactly one
    /// consumer.
    pub fn register_consumer(
        &mut self,
        subqueue_id: impl Into<String>,
        consumer: Arc<dyn Consumer>,
    ) -> Result<(), QueueError> {
        let subqueue_id = subqueue_id.into();
        if self.consumers.contains_key(&subqueue_id) {
            tracing::error!(subqueue_id, "duplicate consumer sub-queue registration");
            return Err(QueueError::DuplicateSubqueue(subqueue_id));
        }
        self.consumers.insert(subqueue_id, consumer);
        Ok(())
    }

    /// Returns the registered sub-queue ids in sorted order.
    pub fn subqueue_ids(&self) -> Vec<String> {
        self.consumers.keys().cloned().collect()
    }

    /// Decodes an envelope and hands its payload to the matching consumer.
    pub async fn consume_message(&self, raw: &[u8]) -> Result<(), ConsumeError> {
        let envelope: Envelope = serde_json::from_slice(raw)?;

        let Some(consumer) = self.consumers.get(&envelope.subqueue_id) else {
            metrics::counter!("queue_unknown_subqueue_total").increment(1);
            let known = self.subqueue_ids();
            tracing::error!(
                subqueue_id = %envelope.subqueue_id,
                ?known,
                "no consumer registered for sub-queue"
            );
            return Err(ConsumeError::UnknownSubqueue {
                id: envelope.subqueue_id,
                known,
            });
        };

        let result = consumer.consume_message(envelope.message).await;
        let outcome = match &result {
            Ok(()) => "ok",
            Err(err) => err.class().as_str(),
        };
        metrics::counter!(
            "queue_messages_consumed_total",
            "subqueue" => envelope.subqueue_id,
            "outcome" => outcome
        )
        .increment(1);
        result
    }
}
