//! Capability traits implemented by physical queue backends.

use std::time::Duration;

use async_trait::async_trait;

use crate::QueueError;

/// The sending half of a physical queue.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueues one raw message body.
    async fn put(&self, body: String) -> Result<(), QueueError>;
}

/// A message handed out by [`QueueReceiver::receive`]. It stays invisible to
/// other receivers until acknowledged or until its visibility timeout lapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub body: String,
    /// Opaque handle used to acknowledge this particular delivery.
    pub receipt: String,
    /// How many times the transport has handed this message out, this
    /// delivery included.
    pub receive_count: u32,
}

/// The receiving half of a physical queue.
#[async_trait]
pub trait QueueReceiver: Send + Sync {
    /// Long-polls for up to `max_messages` deliveries, waiting at most `wait`
    /// when the queue is empty.
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, QueueError>;

    /// Acknowledges a delivery so that it is never redelivered.
    async fn ack(&self, receipt: &str) -> Result<(), QueueError>;
}
