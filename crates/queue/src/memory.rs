use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::{Delivery, Queue, QueueError, QueueReceiver};

/// Default time a received message stays invisible before redelivery.
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct StoredMessage {
    body: String,
    receive_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<String, (StoredMessage, Instant)>,
    next_receipt: u64,
    acked: usize,
}

impl QueueState {
    /// Moves in-flight messages whose visibility timeout lapsed back to the
    /// front of the ready queue.
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some((message, _)) = self.in_flight.remove(&receipt) {
                self.ready.push_front(message);
            }
        }
    }
}

/// In-memory at-least-once queue for testing and single-process runs.
///
/// Mirrors the SQS contract the workers rely on: a received message is
/// hidden until acknowledged, and reappears once its visibility timeout
/// lapses without an acknowledgement.
#[derive(Clone)]
pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    visibility_timeout: Duration,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }
}

impl InMemoryQueue {
    /// Creates an empty queue with the default visibility timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty queue with a custom visibility timeout.
    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            visibility_timeout,
        }
    }

    /// Returns the bodies of messages waiting to be received.
    pub async fn pending_bodies(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.ready.iter().map(|m| m.body.clone()).collect()
    }

    /// Returns the number of messages waiting to be received.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    /// Returns the number of received, unacknowledged messages.
    pub async fn in_flight_count(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    /// Returns the number of acknowledged messages.
    pub async fn acked_count(&self) -> usize {
        self.state.lock().await.acked
    }

    /// Makes every in-flight message visible again immediately, as if its
    /// visibility timeout had lapsed.
    pub async fn expire_in_flight(&self) {
        let mut state = self.state.lock().await;
        let in_flight: Vec<StoredMessage> = state.in_flight.drain().map(|(_, (m, _))| m).collect();
        state.ready.extend(in_flight);
        drop(state);
        self.notify.notify_waiters();
    }

    async fn take_ready(&self, max_messages: usize) -> Vec<Delivery> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.requeue_expired(now);

        let mut deliveries = Vec::new();
        while deliveries.len() < max_messages {
            let Some(mut message) = state.ready.pop_front() else {
                break;
            };
            message.receive_count += 1;
            state.next_receipt += 1;
            let receipt = format!("receipt-{}", state.next_receipt);
            deliveries.push(Delivery {
                body: message.body.clone(),
                receipt: receipt.clone(),
                receive_count: message.receive_count,
            });
            state
                .in_flight
                .insert(receipt, (message, now + self.visibility_timeout));
        }
        deliveries
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn put(&self, body: String) -> Result<(), QueueError> {
        self.state.lock().await.ready.push_back(StoredMessage {
            body,
            receive_count: 0,
        });
        self.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl QueueReceiver for InMemoryQueue {
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            let deliveries = self.take_ready(max_messages).await;
            if !deliveries.is_empty() || Instant::now() >= deadline {
                return Ok(deliveries);
            }
            // Wake up on a new message, or on the poll deadline.
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.take_ready(max_messages).await);
            }
        }
    }

    async fn ack(&self, receipt: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.in_flight.remove(receipt).is_none() {
            return Err(QueueError::Transport(format!(
                "receipt {receipt} is not in flight"
            )));
        }
        state.acked += 1;
        Ok(())
    }
}
