//! Producer/consumer queue abstraction with sub-queue multiplexing.
//!
//! Many logical producers share one physical queue by wrapping every message
//! in an [`Envelope`] tagged with a sub-queue id. On the receiving side the
//! [`ConsumerMultiplexer`] unwraps the envelope and routes the inner payload
//! to the one [`Consumer`] registered for that id.
//!
//! Delivery is at-least-once: a message whose consumer fails is not
//! acknowledged and comes back after the transport's visibility timeout.

pub mod consumer;
pub mod error;
pub mod memory;
pub mod message;
pub mod producer;
pub mod sqs;
pub mod transport;
pub mod worker;

pub use consumer::{Consumer, ConsumerMultiplexer};
pub use error::{ConsumeError, ErrorClass, QueueError};
pub use memory::InMemoryQueue;
pub use message::{Envelope, Message};
pub use producer::{ProducerMultiplexer, SubQueueHandle};
pub use sqs::SqsQueue;
pub use transport::{Delivery, Queue, QueueReceiver};
pub use worker::{Worker, WorkerConfig};
