//! Storage seams for articles and generation jobs
//!
//! Two implementations exist: [`Repository`](super::Repository) over
//! PostgreSQL and [`MemoryStore`](super::MemoryStore) for tests and
//! single-process mode. Both enforce slug uniqueness and the
//! one-active-job-per-article rule themselves.

use crate::db::models::{Article, GenerationJob};
use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Fields for a new article row
#[derive(Debug, Clone)]
pub struct NewArticle {
    pub user_id: Uuid,
    pub title: String,
    pub slug: String,
    pub content: String,
    pub category_id: Option<Uuid>,
    pub supervisor_id: Option<Uuid>,
    pub tag_ids: Vec<Uuid>,
    pub meta_title: Option<String>,
    pub meta_description: Option<String>,
    pub featured_image_url: Option<String>,
}

/// Partial update of an article. `None` leaves a field untouched; for
/// nullable columns `Some(None)` clears the value.
#[derive(Debug, Clone, Default)]
pub struct ArticleChanges {
    pub title: Option<String>,
    pub slug: Option<String>,
    pub content: Option<String>,
    pub category_id: Option<Option<Uuid>>,
    pub supervisor_id: Option<Option<Uuid>>,
    pub tag_ids: Option<Vec<Uuid>>,
    pub meta_title: Option<Option<String>>,
    pub meta_description: Option<Option<String>>,
    pub featured_image_url: Option<Option<String>>,
}

impl ArticleChanges {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.slug.is_none()
            && self.content.is_none()
            && self.category_id.is_none()
            && self.supervisor_id.is_none()
            && self.tag_ids.is_none()
            && self.meta_title.is_none()
            && self.meta_description.is_none()
            && self.featured_image_url.is_none()
    }
}

#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Check storage connectivity
    async fn ping(&self) -> Result<()>;

    async fn slug_exists(&self, slug: &str) -> Result<bool>;

    /// Insert an article and its tag rows. A taken slug yields
    /// [`AppError::DuplicateSlug`](crate::AppError::DuplicateSlug).
    async fn insert_article(&self, article: NewArticle) -> Result<Article>;

    async fn find_article(&self, id: Uuid) -> Result<Option<Article>>;

    async fn find_article_by_slug(&self, slug: &str) -> Result<Option<Article>>;

    async fn article_tag_ids(&self, id: Uuid) -> Result<Vec<Uuid>>;

    async fn update_article(&self, id: Uuid, changes: ArticleChanges) -> Result<Article>;

    /// Write pipeline output: sets content, clears the generation error and
    /// applies the pipeline-complete status transition.
    async fn apply_generated_content(&self, id: Uuid, content: String) -> Result<Article>;

    /// Annotate the article with a terminal generation failure
    async fn record_generation_error(&self, id: Uuid, error: &str) -> Result<()>;

    /// Apply the publish transition
    async fn publish_article(&self, id: Uuid) -> Result<Article>;

    /// Delete the article together with its tag rows and jobs
    async fn delete_article(&self, id: Uuid) -> Result<bool>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a queued job. Fails with a conflict while another job for the
    /// same article is queued or running.
    async fn create_job(&self, article_id: Uuid, topic: &str, max_attempts: u32)
        -> Result<GenerationJob>;

    async fn find_job(&self, id: Uuid) -> Result<Option<GenerationJob>>;

    async fn latest_job_for_article(&self, article_id: Uuid) -> Result<Option<GenerationJob>>;

    /// Atomically start the next attempt.
    ///
    /// Succeeds for a queued job, or for a running job whose attempt started
    /// more than `stale_after` ago (its worker is gone), as long as attempts
    /// remain. Returns `None` otherwise.
    async fn claim_job(&self, id: Uuid, stale_after: Duration) -> Result<Option<GenerationJob>>;

    async fn mark_job_succeeded(&self, id: Uuid) -> Result<GenerationJob>;

    /// Put the job back to queued after a failed attempt
    async fn mark_job_retrying(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<GenerationJob>;

    async fn mark_job_failed(&self, id: Uuid, error: &str) -> Result<GenerationJob>;

    /// Failed jobs, most recent first
    async fn list_failed_jobs(&self, limit: u64) -> Result<Vec<GenerationJob>>;
}
