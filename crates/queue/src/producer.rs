//! Producer-side sub-queue multiplexing.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use crate::{Envelope, Queue, QueueError};

/// Hands out [`SubQueueHandle`]s that share one physical [`Queue`].
///
/// Registration happens once at process start; registering the same
/// sub-queue id twice is a wiring bug and fails.
pub struct ProducerMultiplexer {
    queue: Arc<dyn Queue>,
    registered: BTreeSet<String>,
}

impl ProducerMultiplexer {
    /// Creates a multiplexer over the given physical queue.
    pub fn new(queue: Arc<dyn Queue>) -> Self {
        Self {
            queue,
            registered: BTreeSet::new(),
        }
    }

    /// Registers a sub-queue and returns the handle that writes to it.
    pub fn register(&mut self, subqueue_id: impl Into<String>) -> Result<SubQueueHandle, QueueError> {
        let subqueue_id = subqueue_id.into();
        if !self.registered.insert(subqueue_id.clone()) {
            tracing::error!(subqueue_id, "duplicate producer sub-queue registration");
            return Err(QueueError::DuplicateSubqueue(subqueue_id));
        }

        Ok(SubQueueHandle {
            subqueue_id: subqueue_id.into(),
            queue: self.queue.clone(),
        })
    }

    /// Returns the registered sub-queue ids in sorted order.
    pub fn subqueue_ids(&self) -> Vec<String> {
        self.registered.iter().cloned().collect()
    }
}

/// A logical producer bound to one sub-queue.
#[derive(Clone)]
pub struct SubQueueHandle {
    subqueue_id: Arc<str>,
    queue: Arc<dyn Queue>,
}

impl SubQueueHandle {
    /// Returns the sub-queue id this handle writes to.
    pub fn subqueue_id(&self) -> &str {
        &self.subqueue_id
    }

    /// Wraps `message` in an envelope and puts it on the physical queue.
    #[tracing::instrument(skip(self, message), fields(subqueue_id = %self.subqueue_id))]
    pub async fn put<M: Serialize + Sync + ?Sized>(&self, message: &M) -> Result<(), QueueError> {
        let envelope = Envelope::wrap(&*self.subqueue_id, message)?;
        let body = serde_json::to_string(&envelope)?;
        self.queue.put(body).await?;

        metrics::counter!("queue_messages_put_total", "subqueue" => self.subqueue_id.to_string())
            .increment(1);
        Ok(())
    }
}
