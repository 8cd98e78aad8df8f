//! Receive loop that feeds one physical queue into a consumer multiplexer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

use crate::{ConsumerMultiplexer, Delivery, ErrorClass, QueueReceiver};

/// Time reserved between a handler's deadline and the message becoming
/// visible to other workers again.
const VISIBILITY_SAFETY_MARGIN: Duration = Duration::from_secs(5);

/// Tuning knobs for a [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum number of messages processed concurrently.
    pub concurrency: usize,
    /// Maximum number of messages requested per receive call.
    pub batch_size: usize,
    /// Long-poll duration of one receive call.
    pub poll_wait: Duration,
    /// Deadline for processing one message.
    pub handler_timeout: Duration,
    /// Pause after a failed receive call.
    pub receive_backoff: Duration,
}

impl WorkerConfig {
    /// Derives a handler deadline that expires before the message becomes
    /// visible to other workers.
    pub fn for_visibility_timeout(visibility_timeout: Duration, concurrency: usize) -> Self {
        let handler_timeout = visibility_timeout
            .saturating_sub(VISIBILITY_SAFETY_MARGIN)
            .max(visibility_timeout / 2);
        Self {
            concurrency: concurrency.max(1),
            batch_size: 10,
            poll_wait: Duration::from_secs(20),
            handler_timeout,
            receive_backoff: Duration::from_secs(1),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::for_visibility_timeout(Duration::from_secs(60), 8)
    }
}

/// Pulls messages from a [`QueueReceiver`] and dispatches them through a
/// [`ConsumerMultiplexer`].
///
/// A message is acknowledged only when its consumer succeeds. Failures and
/// timeouts leave it for redelivery by the transport.
pub struct Worker {
    name: String,
    receiver: Arc<dyn QueueReceiver>,
    consumers: Arc<ConsumerMultiplexer>,
    config: WorkerConfig,
}

impl Worker {
    /// Creates a worker. `name` identifies the physical queue in logs.
    pub fn new(
        name: impl Into<String>,
        receiver: Arc<dyn QueueReceiver>,
        consumers: Arc<ConsumerMultiplexer>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            receiver,
            consumers,
            config,
        }
    }

    /// Runs until `shutdown` flips to true (or its sender is dropped).
    ///
    /// On shutdown the worker stops receiving and waits for in-flight
    /// messages to finish; handlers are never cancelled midway by shutdown.
    #[tracing::instrument(skip_all, fields(queue = %self.name))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut in_flight = JoinSet::new();
        tracing::info!(concurrency = self.config.concurrency, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            while in_flight.try_join_next().is_some() {}

            let free = semaphore.available_permits();
            if free == 0 {
                tokio::select! {
                    _ = in_flight.join_next() => continue,
                    _ = shutdown.changed() => break,
                }
            }

            let received = tokio::select! {
                received = self.receiver.receive(free.min(self.config.batch_size), self.config.poll_wait) => received,
                _ = shutdown.changed() => break,
            };

            let deliveries = match received {
                Ok(deliveries) => deliveries,
                Err(err) => {
                    tracing::warn!(error = %err, "receive failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.receive_backoff) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            };

            for delivery in deliveries {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let receiver = self.receiver.clone();
                let consumers = self.consumers.clone();
                let timeout = self.config.handler_timeout;
                in_flight.spawn(async move {
                    process_delivery(receiver, consumers, delivery, timeout).await;
                    drop(permit);
                });
            }
        }

        tracing::info!(in_flight = in_flight.len(), "worker draining");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "message task aborted");
            }
        }
        tracing::info!("worker stopped");
    }
}

#[tracing::instrument(skip_all, fields(receive_count = delivery.receive_count))]
async fn process_delivery(
    receiver: Arc<dyn QueueReceiver>,
    consumers: Arc<ConsumerMultiplexer>,
    delivery: Delivery,
    timeout: Duration,
) {
    let started = Instant::now();
    let result =
        tokio::time::timeout(timeout, consumers.consume_message(delivery.body.as_bytes())).await;
    metrics::histogram!("queue_message_duration_seconds").record(started.elapsed().as_secs_f64());

    match result {
        Ok(Ok(())) => {
            if let Err(err) = receiver.ack(&delivery.receipt).await {
                // The message will be redelivered; handlers are idempotent.
                tracing::warn!(error = %err, "failed to acknowledge message");
            }
        }
        Ok(Err(err)) => match err.class() {
            ErrorClass::Transient => {
                tracing::warn!(error = %err, "message failed, leaving for redelivery");
            }
            ErrorClass::Permanent | ErrorClass::Invariant => {
                tracing::error!(error = %err, class = %err.class(), "message failed");
            }
        },
        Err(_) => {
            metrics::counter!("queue_message_timeouts_total").increment(1);
            tracing::warn!(?timeout, "message processing timed out, leaving for redelivery");
        }
    }
}
