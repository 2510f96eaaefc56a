//! Generation job queue
//!
//! Provides:
//! - The [`JobQueue`] seam used by the gateway (producer) and the worker
//!   pool (consumer)
//! - An in-process queue for tests and single-process mode
//! - An SQS-backed queue for production
//!
//! Delivery is at-least-once. A message stays with the consumer until it is
//! acked; an unacked message becomes visible again after the visibility
//! timeout. The job row, not the message, is the source of truth for
//! attempts.

mod memory;
mod sqs;

pub use memory::InMemoryQueue;
pub use sqs::SqsQueue;

use crate::config::{QueueBackend, QueueConfig};
use crate::db::models::GenerationJob;
use crate::db::JobStore;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

/// Generation job message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationJobMessage {
    pub job_id: Uuid,
    pub article_id: Uuid,
    pub topic: String,
}

impl From<&GenerationJob> for GenerationJobMessage {
    fn from(job: &GenerationJob) -> Self {
        Self {
            job_id: job.id,
            article_id: job.article_id,
            topic: job.topic.clone(),
        }
    }
}

/// A received message together with the handle needed to ack it
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: GenerationJobMessage,
    pub receipt_handle: String,
    /// How many times this message has been handed out, this time included
    pub receive_count: u32,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn send(&self, message: &GenerationJobMessage) -> Result<()>;

    /// Send a message that becomes visible only after `delay`
    async fn send_delayed(&self, message: &GenerationJobMessage, delay: Duration) -> Result<()>;

    /// Wait up to the configured poll time for at most `max_messages`
    async fn receive(&self, max_messages: usize) -> Result<Vec<Delivery>>;

    /// Remove a delivered message for good
    async fn ack(&self, delivery: &Delivery) -> Result<()>;
}

/// Build the queue selected in configuration
pub async fn connect(config: &QueueConfig, visibility_floor: Duration) -> Result<Arc<dyn JobQueue>> {
    match config.backend {
        QueueBackend::Memory => {
            info!("Using in-memory generation queue");
            let visibility = Duration::from_secs(config.visibility_timeout_secs).max(visibility_floor);
            Ok(Arc::new(InMemoryQueue::new(
                visibility,
                Duration::from_secs(config.poll_timeout_secs),
            )))
        }
        QueueBackend::Sqs => {
            let queue = SqsQueue::from_config(config).await?;
            Ok(Arc::new(queue))
        }
    }
}

/// Record a queued job for the article and publish its message.
///
/// If the message cannot be sent the job is marked failed right away, so no
/// queued row is left behind without a message to drive it.
pub async fn enqueue_generation(
    jobs: &dyn JobStore,
    queue: &dyn JobQueue,
    article_id: Uuid,
    topic: &str,
    max_attempts: u32,
) -> Result<GenerationJob> {
    let job = jobs.create_job(article_id, topic, max_attempts).await?;

    if let Err(e) = queue.send(&GenerationJobMessage::from(&job)).await {
        error!(job_id = %job.id, article_id = %article_id, error = %e, "Failed to enqueue generation job");
        let reason = format!("enqueue failed: {}", e);
        jobs.mark_job_failed(job.id, &reason).await?;
        return Err(AppError::QueueError {
            message: format!("Failed to enqueue generation job {}: {}", job.id, e),
        });
    }

    info!(job_id = %job.id, article_id = %article_id, "Generation job enqueued");
    Ok(job)
}
