//! SQS-backed generation queue
//!
//! Provides:
//! - SQS client wrapper with retry on send
//! - Message serialization/deserialization
//! - Removal of unparseable (poison) messages

use crate::config::QueueConfig;
use crate::errors::{AppError, Result};
use crate::queue::{Delivery, GenerationJobMessage, JobQueue};
use async_trait::async_trait;
use aws_sdk_sqs::types::{Message, MessageSystemAttributeName};
use aws_sdk_sqs::Client as SqsClient;
use aws_types::region::Region;
use backoff::{future::retry, ExponentialBackoff};
use std::time::Duration;
use tracing::{debug, info, warn};

/// SQS caps message delays at 15 minutes
const MAX_DELAY_SECS: u64 = 900;

/// SQS returns at most 10 messages per receive call
const MAX_BATCH: usize = 10;

/// SQS queue client wrapper
pub struct SqsQueue {
    client: SqsClient,
    url: String,
    visibility_timeout: i32,
    wait_time_seconds: i32,
}

impl SqsQueue {
    /// Create a queue client from configuration
    pub async fn from_config(config: &QueueConfig) -> Result<Self> {
        let url = config
            .generation_queue_url
            .clone()
            .ok_or_else(|| AppError::Configuration {
                message: "queue.generation_queue_url is not set".to_string(),
            })?;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(ref region) = config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let aws_config = loader.load().await;

        info!(url = %url, "Connected to SQS generation queue");

        Ok(Self::with_client(
            SqsClient::new(&aws_config),
            url,
            config.visibility_timeout_secs,
            config.poll_timeout_secs,
        ))
    }

    /// Create with an existing client
    pub fn with_client(
        client: SqsClient,
        url: String,
        visibility_timeout_secs: u64,
        poll_timeout_secs: u64,
    ) -> Self {
        Self {
            client,
            url,
            visibility_timeout: visibility_timeout_secs.min(i32::MAX as u64) as i32,
            // Long polling is capped at 20 seconds
            wait_time_seconds: poll_timeout_secs.min(20) as i32,
        }
    }

    async fn send_body(&self, body: String, delay_seconds: i32) -> Result<()> {
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        let message_id = retry(policy, || async {
            let result = self
                .client
                .send_message()
                .queue_url(&self.url)
                .message_body(&body)
                .delay_seconds(delay_seconds)
                .send()
                .await
                .map_err(|e| {
                    warn!(error = %e, "SQS send failed, retrying");
                    backoff::Error::transient(AppError::QueueError {
                        message: format!("Failed to send message: {}", e),
                    })
                })?;
            Ok::<String, backoff::Error<AppError>>(result.message_id.unwrap_or_default())
        })
        .await?;

        debug!(message_id = %message_id, delay_seconds, "Message sent to queue");
        Ok(())
    }

    /// Delete a message after processing
    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| AppError::QueueError {
                message: format!("Failed to delete message: {}", e),
            })?;

        debug!("Message deleted from queue");
        Ok(())
    }

    /// Parse message body as JSON
    fn parse_message(message: &Message) -> Result<GenerationJobMessage> {
        let body = message.body.as_ref().ok_or_else(|| AppError::QueueError {
            message: "Message has no body".to_string(),
        })?;

        serde_json::from_str(body).map_err(|e| AppError::QueueError {
            message: format!("Failed to parse message: {}", e),
        })
    }

    fn receive_count(message: &Message) -> u32 {
        message
            .attributes
            .as_ref()
            .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
            .and_then(|count| count.parse().ok())
            .unwrap_or(1)
    }
}

#[async_trait]
impl JobQueue for SqsQueue {
    async fn send(&self, message: &GenerationJobMessage) -> Result<()> {
        let body = serde_json::to_string(message)?;
        self.send_body(body, 0).await
    }

    async fn send_delayed(&self, message: &GenerationJobMessage, delay: Duration) -> Result<()> {
        let body = serde_json::to_string(message)?;
        let delay_seconds = delay.as_secs().min(MAX_DELAY_SECS) as i32;
        self.send_body(body, delay_seconds).await
    }

    async fn receive(&self, max_messages: usize) -> Result<Vec<Delivery>> {
        let max_messages = max_messages.clamp(1, MAX_BATCH) as i32;

        let result = self
            .client
            .receive_message()
            .queue_url(&self.url)
            .max_number_of_messages(max_messages)
            .visibility_timeout(self.visibility_timeout)
            .wait_time_seconds(self.wait_time_seconds)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| AppError::QueueError {
                message: format!("Failed to receive messages: {}", e),
            })?;

        let messages = result.messages.unwrap_or_default();
        debug!(count = messages.len(), "Received messages from queue");

        let mut deliveries = Vec::with_capacity(messages.len());
        for message in messages {
            let Some(receipt_handle) = message.receipt_handle.clone() else {
                continue;
            };

            match Self::parse_message(&message) {
                Ok(parsed) => deliveries.push(Delivery {
                    message: parsed,
                    receipt_handle,
                    receive_count: Self::receive_count(&message),
                }),
                Err(e) => {
                    // Poison message: it will never parse, so drop it
                    warn!(
                        message_id = ?message.message_id,
                        error = %e,
                        "Discarding unparseable queue message"
                    );
                    self.delete(&receipt_handle).await?;
                }
            }
        }

        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.delete(&delivery.receipt_handle).await
    }
}
