//! Job scheduler and worker pool
//!
//! Pulls generation messages from the queue and runs them on a bounded pool.
//! The job row decides what a delivery means:
//! - queued (or running past the run-time limit, its worker gone) with
//!   attempts left: start the next attempt
//! - running and fresh: another worker has it; leave the message unacked so
//!   it comes back after the visibility timeout
//! - running past the limit on its last attempt: fail it and drop the message
//! - terminal or deleted: drop the message
//!
//! After a failed attempt the scheduler alone decides between retry and
//! terminal failure, from the attempt count. Retries are re-enqueued with
//! exponential delay; a terminal failure is logged and annotated on the
//! article.

use crate::errors::GenerationError;
use crate::pipeline::ArticleGenerator;
use blogforge_common::config::GenerationConfig;
use blogforge_common::db::models::{GenerationJob, JobStatus};
use blogforge_common::db::{ArticleStore, JobStore};
use blogforge_common::errors::{AppError, Result};
use blogforge_common::metrics;
use blogforge_common::queue::{Delivery, GenerationJobMessage, JobQueue};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Consecutive infrastructure failures before the poll loop pauses
const MAX_FAILURES: u32 = 5;
const CIRCUIT_BREAK_DURATION: Duration = Duration::from_secs(30);
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Jobs processed concurrently
    pub workers: usize,
    /// Upper bound for one attempt of the whole pipeline
    pub max_run_time: Duration,
    /// Delay before the second attempt; doubles after that
    pub retry_base_delay: Duration,
}

impl From<&GenerationConfig> for SchedulerConfig {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            max_run_time: config.max_run_time(),
            retry_base_delay: config.retry_base_delay(),
        }
    }
}

impl SchedulerConfig {
    /// Delay before the attempt that follows `attempt` (1-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_base_delay.saturating_mul(1u32 << exponent)
    }
}

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Retrying { attempt: u32, delay: Duration },
    Failed,
    /// Nothing ran; `acked` tells whether the message was dropped
    Skipped { acked: bool },
}

impl JobOutcome {
    fn label(&self) -> &'static str {
        match self {
            JobOutcome::Succeeded => "succeeded",
            JobOutcome::Retrying { .. } => "retrying",
            JobOutcome::Failed => "failed",
            JobOutcome::Skipped { .. } => "skipped",
        }
    }
}

/// Removes the article from the in-process running set when dropped
struct RunningGuard<'a> {
    running: &'a Mutex<HashSet<Uuid>>,
    article_id: Uuid,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.article_id);
        }
    }
}

pub struct GenerationScheduler {
    generator: Arc<ArticleGenerator>,
    articles: Arc<dyn ArticleStore>,
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    config: SchedulerConfig,
    /// Articles with an attempt in progress in this process
    running: Mutex<HashSet<Uuid>>,
    consecutive_failures: AtomicU32,
}

impl GenerationScheduler {
    pub fn new(
        generator: Arc<ArticleGenerator>,
        articles: Arc<dyn ArticleStore>,
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            generator,
            articles,
            jobs,
            queue,
            config,
            running: Mutex::new(HashSet::new()),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    fn try_mark_running(&self, article_id: Uuid) -> Option<RunningGuard<'_>> {
        let mut running = self.running.lock().ok()?;
        if !running.insert(article_id) {
            return None;
        }
        Some(RunningGuard {
            running: &self.running,
            article_id,
        })
    }

    /// Handle one delivery from start to ack.
    #[instrument(
        skip(self, delivery),
        fields(job_id = %delivery.message.job_id, article_id = %delivery.message.article_id)
    )]
    pub async fn process_delivery(&self, delivery: &Delivery) -> Result<JobOutcome> {
        let message = &delivery.message;

        let Some(_guard) = self.try_mark_running(message.article_id) else {
            debug!("Article already generating in this process, leaving message for later");
            return Ok(JobOutcome::Skipped { acked: false });
        };

        let Some(job) = self
            .jobs
            .claim_job(message.job_id, self.config.max_run_time)
            .await?
        else {
            return self.settle_unclaimed(delivery).await;
        };

        let attempt = job.attempt_count as u32;
        info!(attempt, max_attempts = job.max_attempts, "Starting generation attempt");

        let started = Instant::now();
        let result = tokio::time::timeout(
            self.config.max_run_time,
            self.generator.generate(job.article_id, &job.topic),
        )
        .await
        .unwrap_or(Err(GenerationError::RunTimeExceeded(self.config.max_run_time)));
        let elapsed = started.elapsed();

        let outcome = match result {
            // Deleted mid-run; its job row is gone too
            Err(GenerationError::ArticleNotFound(_))
            | Err(GenerationError::Store(AppError::ArticleNotFound { .. })) => {
                info!("Article deleted during generation, dropping message");
                return self.drop_message(delivery).await;
            }
            Ok(_) => {
                self.jobs.mark_job_succeeded(job.id).await?;
                info!(attempt, duration_ms = elapsed.as_millis() as u64, "Generation job succeeded");
                JobOutcome::Succeeded
            }
            Err(e) => self.handle_failure(&job, e).await?,
        };

        self.queue.ack(delivery).await?;
        metrics::record_job_outcome(outcome.label(), Some(elapsed));
        Ok(outcome)
    }

    /// Decide retry vs terminal failure after a failed attempt
    async fn handle_failure(&self, job: &GenerationJob, err: GenerationError) -> Result<JobOutcome> {
        let attempt = job.attempt_count as u32;
        let reason = err.to_string();

        if job.attempts_exhausted() {
            self.fail_terminally(job, &reason).await?;
            return Ok(JobOutcome::Failed);
        }

        let delay = self.config.retry_delay(attempt);
        let next_retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        self.jobs
            .mark_job_retrying(job.id, &reason, next_retry_at)
            .await?;
        self.queue
            .send_delayed(&GenerationJobMessage::from(job), delay)
            .await?;

        warn!(
            attempt,
            max_attempts = job.max_attempts,
            retry_in_secs = delay.as_secs_f64(),
            error = %reason,
            "Generation attempt failed, retry scheduled"
        );
        metrics::record_job_retry(attempt);

        Ok(JobOutcome::Retrying { attempt, delay })
    }

    async fn fail_terminally(&self, job: &GenerationJob, reason: &str) -> Result<()> {
        self.jobs.mark_job_failed(job.id, reason).await?;

        match self.articles.record_generation_error(job.article_id, reason).await {
            Ok(()) => {}
            // Deleted while generating; the job row went with it
            Err(AppError::ArticleNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        error!(
            job_id = %job.id,
            article_id = %job.article_id,
            attempts = job.attempt_count,
            error = %reason,
            "Generation job failed permanently"
        );
        Ok(())
    }

    /// The claim was refused; work out whether the message is still needed
    async fn settle_unclaimed(&self, delivery: &Delivery) -> Result<JobOutcome> {
        let Some(job) = self.jobs.find_job(delivery.message.job_id).await? else {
            debug!("Job no longer exists, dropping message");
            return self.drop_message(delivery).await;
        };

        match job.job_status() {
            JobStatus::Succeeded | JobStatus::Failed => {
                debug!(status = job.job_status().as_str(), "Job already finished, dropping message");
                self.drop_message(delivery).await
            }
            JobStatus::Queued if job.attempts_exhausted() => {
                let reason = job
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "attempts exhausted".to_string());
                self.fail_terminally(&job, &reason).await?;
                self.drop_message(delivery).await
            }
            // Its worker died during the last allowed attempt
            JobStatus::Running if job.attempts_exhausted() && self.run_expired(&job) => {
                let reason = GenerationError::RunTimeExceeded(self.config.max_run_time).to_string();
                self.fail_terminally(&job, &reason).await?;
                self.drop_message(delivery).await
            }
            JobStatus::Queued | JobStatus::Running => {
                debug!("Job held by another worker, leaving message for redelivery");
                metrics::record_job_outcome("skipped", None);
                Ok(JobOutcome::Skipped { acked: false })
            }
        }
    }

    /// Whether the current attempt has outlived the run-time limit
    fn run_expired(&self, job: &GenerationJob) -> bool {
        let Ok(limit) = chrono::Duration::from_std(self.config.max_run_time) else {
            return false;
        };
        job.started_at
            .map(|started| started.with_timezone(&Utc) + limit < Utc::now())
            .unwrap_or(false)
    }

    async fn drop_message(&self, delivery: &Delivery) -> Result<JobOutcome> {
        self.queue.ack(delivery).await?;
        metrics::record_job_outcome("skipped", None);
        Ok(JobOutcome::Skipped { acked: true })
    }

    async fn handle(&self, delivery: Delivery) {
        match self.process_delivery(&delivery).await {
            Ok(_) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                // Unacked: the queue redelivers after the visibility timeout
                error!(
                    job_id = %delivery.message.job_id,
                    error = %e,
                    failures,
                    "Failed to process generation job"
                );
            }
        }
    }

    /// Poll the queue until `shutdown` flips, then wait for in-flight jobs.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let mut tasks = JoinSet::new();

        info!(workers = self.config.workers, "Generation worker pool started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    error!(error = %e, "Generation task panicked");
                }
            }

            // Circuit breaker check
            let failures = self.consecutive_failures.load(Ordering::Relaxed);
            if failures >= MAX_FAILURES {
                warn!(failures, "Circuit breaker open, pausing...");
                tokio::select! {
                    _ = tokio::time::sleep(CIRCUIT_BREAK_DURATION) => {}
                    _ = shutdown.changed() => break,
                }
                self.consecutive_failures.store(0, Ordering::Relaxed);
                info!("Circuit breaker reset, resuming...");
            }

            // Only poll for as many messages as there are free workers
            let first_permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };
            let capacity = 1 + semaphore.available_permits();

            let received = tokio::select! {
                result = self.queue.receive(capacity) => result,
                _ = shutdown.changed() => break,
            };

            let deliveries = match received {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    error!(error = %e, failures, "Failed to receive messages from queue");
                    tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let mut first_permit = Some(first_permit);
            for delivery in deliveries {
                let permit = match first_permit.take() {
                    Some(permit) => permit,
                    None => match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                debug!(
                    job_id = %delivery.message.job_id,
                    receive_count = delivery.receive_count,
                    "Received generation job"
                );

                let scheduler = Arc::clone(&self);
                tasks.spawn(async move {
                    let _permit = permit;
                    scheduler.handle(delivery).await;
                });
            }
        }

        info!(in_flight = tasks.len(), "Shutdown requested, waiting for in-flight jobs");
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Generation task panicked");
            }
        }
        info!("Generation worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StageError;
    use crate::pipeline::tests::{draft, draft_with_slug, ScriptedInvoker, ANALYSIS_OK, SCRAPE_OK};
    use crate::stage::{ProcessStageInvoker, Stage, StageCommand, StageInvoker};
    use std::sync::atomic::AtomicUsize;
    use blogforge_common::db::models::{ArticleStatus, GenerationState};
    use blogforge_common::db::MemoryStore;
    use blogforge_common::queue::{enqueue_generation, InMemoryQueue};

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            workers: 2,
            max_run_time: Duration::from_secs(5),
            retry_base_delay: Duration::from_millis(10),
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<InMemoryQueue>,
        invoker: Arc<ScriptedInvoker>,
        scheduler: Arc<GenerationScheduler>,
    }

    fn harness(invoker: ScriptedInvoker) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(InMemoryQueue::new(Duration::from_secs(30), Duration::from_millis(500)));
        let invoker = Arc::new(invoker);
        let generator = Arc::new(ArticleGenerator::new(invoker.clone(), store.clone()));
        let scheduler = Arc::new(GenerationScheduler::new(
            generator,
            store.clone(),
            store.clone(),
            queue.clone(),
            test_config(),
        ));
        Harness {
            store,
            queue,
            invoker,
            scheduler,
        }
    }

    fn scheduler_with(
        h: &Harness,
        invoker: Arc<dyn StageInvoker>,
        config: SchedulerConfig,
    ) -> GenerationScheduler {
        GenerationScheduler::new(
            Arc::new(ArticleGenerator::new(invoker, h.store.clone())),
            h.store.clone(),
            h.store.clone(),
            h.queue.clone(),
            config,
        )
    }

    fn short_run_time() -> SchedulerConfig {
        SchedulerConfig {
            max_run_time: Duration::from_millis(50),
            ..test_config()
        }
    }

    /// Never finishes a scrape within any test run-time limit
    #[derive(Default)]
    struct SlowInvoker {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl StageInvoker for SlowInvoker {
        async fn invoke(&self, _stage: Stage, _args: &[String]) -> std::result::Result<String, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(SCRAPE_OK.to_string())
        }
    }

    #[test]
    fn test_retry_delay_doubles() {
        let config = test_config();
        assert_eq!(config.retry_delay(1), Duration::from_millis(10));
        assert_eq!(config.retry_delay(2), Duration::from_millis(20));
        assert_eq!(config.retry_delay(3), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_success_acks_and_keeps_draft() {
        let h = harness(ScriptedInvoker::happy());
        let article = draft(&h.store).await;
        let job = enqueue_generation(h.store.as_ref(), h.queue.as_ref(), article.id, "rust ownership", 3)
            .await
            .unwrap();

        let deliveries = h.queue.receive(1).await.unwrap();
        let outcome = h.scheduler.process_delivery(&deliveries[0]).await.unwrap();
        assert_eq!(outcome, JobOutcome::Succeeded);

        let job = h.store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.job_status(), JobStatus::Succeeded);
        assert_eq!(job.attempt_count, 1);

        let article = h.store.find_article(article.id).await.unwrap().unwrap();
        assert_eq!(article.article_status(), ArticleStatus::Draft);
        assert_eq!(article.generation_state(), GenerationState::Complete);
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_always_failing_job_runs_exactly_three_times() {
        let h = harness(ScriptedInvoker::failing_at(Stage::Scrape));
        let article = draft(&h.store).await;
        let job = enqueue_generation(h.store.as_ref(), h.queue.as_ref(), article.id, "rust", 3)
            .await
            .unwrap();

        let mut outcomes = Vec::new();
        for _ in 0..10 {
            let deliveries = h.queue.receive(1).await.unwrap();
            let Some(delivery) = deliveries.into_iter().next() else {
                break;
            };
            outcomes.push(h.scheduler.process_delivery(&delivery).await.unwrap());
            if outcomes.last() == Some(&JobOutcome::Failed) {
                break;
            }
        }

        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[0], JobOutcome::Retrying { attempt: 1, .. }));
        assert!(matches!(outcomes[1], JobOutcome::Retrying { attempt: 2, .. }));
        assert_eq!(outcomes[2], JobOutcome::Failed);
        assert_eq!(h.invoker.call_count(), 3);

        let stored = h.store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.job_status(), JobStatus::Failed);
        assert_eq!(stored.attempt_count, 3);
        assert!(stored.last_error.is_some());

        let article = h.store.find_article(article.id).await.unwrap().unwrap();
        assert_eq!(article.content, "");
        assert_eq!(article.generation_state(), GenerationState::Failed);
        assert!(h.queue.is_empty().await);

        // A stray redelivery never starts a fourth attempt
        h.queue.send(&GenerationJobMessage::from(&stored)).await.unwrap();
        let deliveries = h.queue.receive(1).await.unwrap();
        let outcome = h.scheduler.process_delivery(&deliveries[0]).await.unwrap();
        assert_eq!(outcome, JobOutcome::Skipped { acked: true });
        assert_eq!(h.invoker.call_count(), 3);
    }

    #[tokio::test]
    async fn test_worker_lost_on_final_attempt_fails_job() {
        let h = harness(ScriptedInvoker::happy());
        let scheduler = scheduler_with(&h, h.invoker.clone(), short_run_time());
        let article = draft(&h.store).await;
        let job = enqueue_generation(h.store.as_ref(), h.queue.as_ref(), article.id, "rust", 3)
            .await
            .unwrap();

        // Two failed attempts, then a worker that dies during the third
        for _ in 0..2 {
            h.store.claim_job(job.id, Duration::from_secs(300)).await.unwrap().unwrap();
            h.store
                .mark_job_retrying(job.id, "scrape failed", Utc::now())
                .await
                .unwrap();
        }
        let last = h.store.claim_job(job.id, Duration::from_secs(300)).await.unwrap().unwrap();
        assert_eq!(last.attempt_count, 3);

        tokio::time::sleep(Duration::from_millis(100)).await;

        let deliveries = h.queue.receive(1).await.unwrap();
        let outcome = scheduler.process_delivery(&deliveries[0]).await.unwrap();
        assert_eq!(outcome, JobOutcome::Skipped { acked: true });
        assert_eq!(h.invoker.call_count(), 0);
        assert!(h.queue.is_empty().await);

        let stored = h.store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.job_status(), JobStatus::Failed);
        assert_eq!(stored.attempt_count, 3);

        let article = h.store.find_article(article.id).await.unwrap().unwrap();
        assert!(article.generation_error.is_some());
        assert_eq!(article.generation_state(), GenerationState::Failed);
    }

    #[tokio::test]
    async fn test_final_attempt_still_running_is_left_unacked() {
        let h = harness(ScriptedInvoker::happy());
        let article = draft(&h.store).await;
        let job = enqueue_generation(h.store.as_ref(), h.queue.as_ref(), article.id, "rust", 1)
            .await
            .unwrap();
        h.store.claim_job(job.id, Duration::from_secs(300)).await.unwrap().unwrap();

        let deliveries = h.queue.receive(1).await.unwrap();
        let outcome = h.scheduler.process_delivery(&deliveries[0]).await.unwrap();
        assert_eq!(outcome, JobOutcome::Skipped { acked: false });

        let stored = h.store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.job_status(), JobStatus::Running);
    }

    #[tokio::test]
    async fn test_attempt_over_run_time_retries_then_fails() {
        let h = harness(ScriptedInvoker::happy());
        let invoker = Arc::new(SlowInvoker::default());
        let scheduler = scheduler_with(&h, invoker.clone(), short_run_time());
        let article = draft(&h.store).await;
        let job = enqueue_generation(h.store.as_ref(), h.queue.as_ref(), article.id, "rust", 3)
            .await
            .unwrap();

        let deliveries = h.queue.receive(1).await.unwrap();
        let outcome = scheduler.process_delivery(&deliveries[0]).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Retrying { attempt: 1, .. }));

        let stored = h.store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.job_status(), JobStatus::Queued);
        assert!(stored.last_error.as_deref().unwrap_or("").contains("maximum run time"));
        let current = h.store.find_article(article.id).await.unwrap().unwrap();
        assert_eq!(current.content, "");
        assert_eq!(current.generation_state(), GenerationState::Pending);

        let mut outcomes = vec![outcome];
        for _ in 0..10 {
            let deliveries = h.queue.receive(1).await.unwrap();
            let Some(delivery) = deliveries.into_iter().next() else {
                continue;
            };
            outcomes.push(scheduler.process_delivery(&delivery).await.unwrap());
            if outcomes.last() == Some(&JobOutcome::Failed) {
                break;
            }
        }

        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[1], JobOutcome::Retrying { attempt: 2, .. }));
        assert_eq!(outcomes[2], JobOutcome::Failed);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 3);

        let stored = h.store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.job_status(), JobStatus::Failed);
        let current = h.store.find_article(article.id).await.unwrap().unwrap();
        assert_eq!(current.content, "");
        assert_eq!(current.generation_state(), GenerationState::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_time_limit_kills_stage_process() {
        let h = harness(ScriptedInvoker::happy());
        let marker = std::env::temp_dir().join(format!("blogforge-stage-{}", Uuid::new_v4()));
        let script = format!("sleep 1; touch '{}'; echo '[]'", marker.display());
        let invoker = ProcessStageInvoker::new(Duration::from_secs(30)).with_stage(
            Stage::Scrape,
            StageCommand::new("sh").with_args(vec!["-c".to_string(), script, "stage".to_string()]),
        );
        let config = SchedulerConfig {
            max_run_time: Duration::from_millis(200),
            ..test_config()
        };
        let scheduler = scheduler_with(&h, Arc::new(invoker), config);
        let article = draft(&h.store).await;
        enqueue_generation(h.store.as_ref(), h.queue.as_ref(), article.id, "rust", 3)
            .await
            .unwrap();

        let deliveries = h.queue.receive(1).await.unwrap();
        let outcome = scheduler.process_delivery(&deliveries[0]).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Retrying { attempt: 1, .. }));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "stage process outlived its attempt");
    }

    #[tokio::test]
    async fn test_job_running_elsewhere_is_left_unacked() {
        let h = harness(ScriptedInvoker::happy());
        let article = draft(&h.store).await;
        let job = enqueue_generation(h.store.as_ref(), h.queue.as_ref(), article.id, "rust", 3)
            .await
            .unwrap();

        // Another worker claimed it moments ago
        h.store.claim_job(job.id, Duration::from_secs(300)).await.unwrap().unwrap();

        let deliveries = h.queue.receive(1).await.unwrap();
        let outcome = h.scheduler.process_delivery(&deliveries[0]).await.unwrap();
        assert_eq!(outcome, JobOutcome::Skipped { acked: false });
        assert_eq!(h.invoker.call_count(), 0);
        assert!(!h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_deleted_article_drops_message() {
        let h = harness(ScriptedInvoker::happy());
        let article = draft(&h.store).await;
        enqueue_generation(h.store.as_ref(), h.queue.as_ref(), article.id, "rust", 3)
            .await
            .unwrap();
        h.store.delete_article(article.id).await.unwrap();

        let deliveries = h.queue.receive(1).await.unwrap();
        let outcome = h.scheduler.process_delivery(&deliveries[0]).await.unwrap();
        assert_eq!(outcome, JobOutcome::Skipped { acked: true });
        assert!(h.queue.is_empty().await);
    }

    /// Deletes the article while the last stage runs
    struct DeletingInvoker {
        store: Arc<MemoryStore>,
        article_id: Uuid,
    }

    #[async_trait::async_trait]
    impl StageInvoker for DeletingInvoker {
        async fn invoke(&self, stage: Stage, _args: &[String]) -> std::result::Result<String, StageError> {
            let output = match stage {
                Stage::Scrape => SCRAPE_OK,
                Stage::Analyze => ANALYSIS_OK,
                Stage::BuildPrompt => "prompt",
                Stage::SynthesizeArticle => {
                    self.store.delete_article(self.article_id).await.unwrap();
                    "body"
                }
            };
            Ok(output.to_string())
        }
    }

    #[tokio::test]
    async fn test_article_deleted_mid_run_is_not_retried() {
        let h = harness(ScriptedInvoker::happy());
        let article = draft(&h.store).await;
        enqueue_generation(h.store.as_ref(), h.queue.as_ref(), article.id, "rust", 3)
            .await
            .unwrap();

        let invoker = Arc::new(DeletingInvoker {
            store: h.store.clone(),
            article_id: article.id,
        });
        let scheduler = GenerationScheduler::new(
            Arc::new(ArticleGenerator::new(invoker, h.store.clone())),
            h.store.clone(),
            h.store.clone(),
            h.queue.clone(),
            test_config(),
        );

        let deliveries = h.queue.receive(1).await.unwrap();
        let outcome = scheduler.process_delivery(&deliveries[0]).await.unwrap();
        assert_eq!(outcome, JobOutcome::Skipped { acked: true });
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_run_loop_processes_and_stops_on_shutdown() {
        let h = harness(ScriptedInvoker::happy());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.scheduler.clone().run(rx));

        let mut job_ids = Vec::new();
        for i in 0..3 {
            let article = draft_with_slug(&h.store, &format!("article-{}", i)).await;
            let job = enqueue_generation(h.store.as_ref(), h.queue.as_ref(), article.id, "rust", 3)
                .await
                .unwrap();
            job_ids.push(job.id);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let mut done = 0;
            for id in &job_ids {
                let job = h.store.find_job(*id).await.unwrap().unwrap();
                if job.job_status() == JobStatus::Succeeded {
                    done += 1;
                }
            }
            if done == job_ids.len() {
                break;
            }
            assert!(Instant::now() < deadline, "jobs did not finish in time");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker pool did not stop")
            .unwrap();
    }
}
