use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::MessageSystemAttributeName;

use crate::{Delivery, Queue, QueueError, QueueReceiver};

/// SQS caps a single receive at ten messages.
const MAX_RECEIVE_BATCH: usize = 10;

/// SQS caps long polling at twenty seconds.
const MAX_WAIT_SECS: u64 = 20;

/// An SQS queue used as both the sending and the receiving half.
///
/// Dead-lettering is left to the queue's redrive policy: a message whose
/// consumer keeps failing is moved to the DLQ by SQS once its receive count
/// exceeds the configured maximum.
#[derive(Clone)]
pub struct SqsQueue {
    client: Client,
    queue_url: String,
    visibility_timeout: Duration,
}

impl SqsQueue {
    /// Creates a queue bound to `queue_url`. Received messages stay hidden
    /// for `visibility_timeout`.
    pub fn new(client: Client, queue_url: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
            visibility_timeout,
        }
    }

    /// Returns the queue URL.
    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }
}

fn transport_error<E: std::error::Error>(err: E) -> QueueError {
    QueueError::Transport(DisplayErrorContext(err).to_string())
}

#[async_trait]
impl Queue for SqsQueue {
    async fn put(&self, body: String) -> Result<(), QueueError> {
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(transport_error)?;
        Ok(())
    }
}

#[async_trait]
impl QueueReceiver for SqsQueue {
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let max_messages = max_messages.clamp(1, MAX_RECEIVE_BATCH) as i32;
        let wait_secs = wait.as_secs().min(MAX_WAIT_SECS) as i32;
        let visibility_secs = i32::try_from(self.visibility_timeout.as_secs()).unwrap_or(i32::MAX);

        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_secs)
            .visibility_timeout(visibility_secs)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(transport_error)?;

        let mut deliveries = Vec::new();
        for message in output.messages() {
            let (Some(body), Some(receipt)) = (message.body(), message.receipt_handle()) else {
                tracing::warn!(message_id = ?message.message_id(), "skipping SQS message without body or receipt");
                continue;
            };
            let receive_count = message
                .attributes()
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|count| count.parse().ok())
                .unwrap_or(1);
            deliveries.push(Delivery {
                body: body.to_string(),
                receipt: receipt.to_string(),
                receive_count,
            });
        }
        Ok(deliveries)
    }

    async fn ack(&self, receipt: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .send()
            .await
            .map_err(transport_error)?;
        Ok(())
    }
}
