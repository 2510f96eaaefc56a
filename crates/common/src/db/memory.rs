//! In-process store for tests and single-process mode

use crate::db::models::{
    Article, ArticleEvent, ArticleStatus, GenerationJob, JobStatus,
};
use crate::db::store::{ArticleChanges, ArticleStore, JobStore, NewArticle};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    articles: HashMap<Uuid, Article>,
    tags: HashMap<Uuid, Vec<Uuid>>,
    jobs: HashMap<Uuid, GenerationJob>,
}

impl State {
    fn slug_taken(&self, slug: &str, except: Option<Uuid>) -> bool {
        self.articles
            .values()
            .any(|a| a.slug == slug && Some(a.id) != except)
    }

    fn article_mut(&mut self, id: Uuid) -> Result<&mut Article> {
        self.articles
            .get_mut(&id)
            .ok_or_else(|| AppError::ArticleNotFound { id: id.to_string() })
    }

    fn job_mut(&mut self, id: Uuid) -> Result<&mut GenerationJob> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| AppError::JobNotFound { id: id.to_string() })
    }
}

/// Article and job store kept in memory. All checks and writes for one
/// operation happen under a single lock, so uniqueness holds under
/// concurrent callers.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArticleStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn slug_exists(&self, slug: &str) -> Result<bool> {
        Ok(self.state.lock().await.slug_taken(slug, None))
    }

    async fn insert_article(&self, new: NewArticle) -> Result<Article> {
        let mut state = self.state.lock().await;

        if state.slug_taken(&new.slug, None) {
            return Err(AppError::DuplicateSlug { slug: new.slug });
        }

        let now = Utc::now();
        let article = Article {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            category_id: new.category_id,
            supervisor_id: new.supervisor_id,
            title: new.title,
            slug: new.slug,
            content: new.content,
            status: ArticleStatus::Draft.into(),
            meta_title: new.meta_title,
            meta_description: new.meta_description,
            featured_image_url: new.featured_image_url,
            generation_error: None,
            created_at: now.into(),
            updated_at: now.into(),
        };

        state.tags.insert(article.id, new.tag_ids);
        state.articles.insert(article.id, article.clone());
        Ok(article)
    }

    async fn find_article(&self, id: Uuid) -> Result<Option<Article>> {
        Ok(self.state.lock().await.articles.get(&id).cloned())
    }

    async fn find_article_by_slug(&self, slug: &str) -> Result<Option<Article>> {
        Ok(self
            .state
            .lock()
            .await
            .articles
            .values()
            .find(|a| a.slug == slug)
            .cloned())
    }

    async fn article_tag_ids(&self, id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .state
            .lock()
            .await
            .tags
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_article(&self, id: Uuid, changes: ArticleChanges) -> Result<Article> {
        let mut state = self.state.lock().await;

        if let Some(ref slug) = changes.slug {
            if state.slug_taken(slug, Some(id)) {
                return Err(AppError::DuplicateSlug { slug: slug.clone() });
            }
        }

        let article = state.article_mut(id)?;
        if let Some(title) = changes.title {
            article.title = title;
        }
        if let Some(slug) = changes.slug {
            article.slug = slug;
        }
        if let Some(content) = changes.content {
            article.content = content;
        }
        if let Some(category_id) = changes.category_id {
            article.category_id = category_id;
        }
        if let Some(supervisor_id) = changes.supervisor_id {
            article.supervisor_id = supervisor_id;
        }
        if let Some(meta_title) = changes.meta_title {
            article.meta_title = meta_title;
        }
        if let Some(meta_description) = changes.meta_description {
            article.meta_description = meta_description;
        }
        if let Some(url) = changes.featured_image_url {
            article.featured_image_url = url;
        }
        article.updated_at = Utc::now().into();
        let updated = article.clone();

        if let Some(tag_ids) = changes.tag_ids {
            state.tags.insert(id, tag_ids);
        }

        Ok(updated)
    }

    async fn apply_generated_content(&self, id: Uuid, content: String) -> Result<Article> {
        let mut state = self.state.lock().await;
        let article = state.article_mut(id)?;

        let status = article
            .article_status()
            .transition(ArticleEvent::PipelineComplete);
        article.content = content;
        article.status = status.into();
        article.generation_error = None;
        article.updated_at = Utc::now().into();

        Ok(article.clone())
    }

    async fn record_generation_error(&self, id: Uuid, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let article = state.article_mut(id)?;
        article.generation_error = Some(error.to_string());
        article.updated_at = Utc::now().into();
        Ok(())
    }

    async fn publish_article(&self, id: Uuid) -> Result<Article> {
        let mut state = self.state.lock().await;
        let article = state.article_mut(id)?;

        let status = article.article_status().transition(ArticleEvent::Publish);
        article.status = status.into();
        article.updated_at = Utc::now().into();

        Ok(article.clone())
    }

    async fn delete_article(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        let removed = state.articles.remove(&id).is_some();
        state.tags.remove(&id);
        state.jobs.retain(|_, job| job.article_id != id);
        Ok(removed)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(
        &self,
        article_id: Uuid,
        topic: &str,
        max_attempts: u32,
    ) -> Result<GenerationJob> {
        let mut state = self.state.lock().await;

        if !state.articles.contains_key(&article_id) {
            return Err(AppError::ArticleNotFound {
                id: article_id.to_string(),
            });
        }

        let active = state
            .jobs
            .values()
            .any(|j| j.article_id == article_id && j.job_status().is_active());
        if active {
            return Err(AppError::Conflict {
                message: format!("Article {} already has an active generation job", article_id),
            });
        }

        let now = Utc::now();
        let job = GenerationJob {
            id: Uuid::new_v4(),
            article_id,
            topic: topic.to_string(),
            status: JobStatus::Queued.into(),
            attempt_count: 0,
            max_attempts: max_attempts as i32,
            last_error: None,
            next_retry_at: None,
            created_at: now.into(),
            started_at: None,
            completed_at: None,
            updated_at: now.into(),
        };

        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<GenerationJob>> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn latest_job_for_article(&self, article_id: Uuid) -> Result<Option<GenerationJob>> {
        Ok(self
            .state
            .lock()
            .await
            .jobs
            .values()
            .filter(|j| j.article_id == article_id)
            .max_by_key(|j| j.created_at)
            .cloned())
    }

    async fn claim_job(&self, id: Uuid, stale_after: Duration) -> Result<Option<GenerationJob>> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };

        let now = Utc::now();
        let stale_after = chrono::Duration::from_std(stale_after).ok();
        let claimable = match job.job_status() {
            JobStatus::Queued => true,
            JobStatus::Running => match (job.started_at, stale_after) {
                (Some(started), Some(after)) => started
                    .with_timezone(&Utc)
                    .checked_add_signed(after)
                    .is_some_and(|deadline| deadline < now),
                _ => false,
            },
            JobStatus::Succeeded | JobStatus::Failed => false,
        };

        if !claimable || job.attempts_exhausted() {
            return Ok(None);
        }

        job.status = JobStatus::Running.into();
        job.attempt_count += 1;
        job.started_at = Some(now.into());
        job.next_retry_at = None;
        job.updated_at = now.into();

        Ok(Some(job.clone()))
    }

    async fn mark_job_succeeded(&self, id: Uuid) -> Result<GenerationJob> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(id)?;
        let now = Utc::now();
        job.status = JobStatus::Succeeded.into();
        job.last_error = None;
        job.completed_at = Some(now.into());
        job.updated_at = now.into();
        Ok(job.clone())
    }

    async fn mark_job_retrying(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<GenerationJob> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(id)?;
        job.status = JobStatus::Queued.into();
        job.last_error = Some(error.to_string());
        job.next_retry_at = Some(next_retry_at.into());
        job.updated_at = Utc::now().into();
        Ok(job.clone())
    }

    async fn mark_job_failed(&self, id: Uuid, error: &str) -> Result<GenerationJob> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(id)?;
        let now = Utc::now();
        job.status = JobStatus::Failed.into();
        job.last_error = Some(error.to_string());
        job.next_retry_at = None;
        job.completed_at = Some(now.into());
        job.updated_at = now.into();
        Ok(job.clone())
    }

    async fn list_failed_jobs(&self, limit: u64) -> Result<Vec<GenerationJob>> {
        let state = self.state.lock().await;
        let mut failed: Vec<GenerationJob> = state
            .jobs
            .values()
            .filter(|j| j.job_status() == JobStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        failed.truncate(limit as usize);
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    fn new_article(slug: &str) -> NewArticle {
        NewArticle {
            user_id: Uuid::new_v4(),
            title: "Title".to_string(),
            slug: slug.to_string(),
            content: String::new(),
            category_id: None,
            supervisor_id: None,
            tag_ids: vec![Uuid::new_v4()],
            meta_title: None,
            meta_description: None,
            featured_image_url: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_slug_rejected() {
        let store = MemoryStore::new();
        store.insert_article(new_article("same")).await.unwrap();

        let err = assert_err!(store.insert_article(new_article("same")).await);
        assert!(matches!(err, AppError::DuplicateSlug { .. }));
    }

    #[tokio::test]
    async fn test_update_to_taken_slug_rejected() {
        let store = MemoryStore::new();
        store.insert_article(new_article("first")).await.unwrap();
        let second = store.insert_article(new_article("second")).await.unwrap();

        let changes = ArticleChanges {
            slug: Some("first".to_string()),
            ..Default::default()
        };
        let err = assert_err!(store.update_article(second.id, changes).await);
        assert!(matches!(err, AppError::DuplicateSlug { .. }));

        // Keeping its own slug is fine
        let changes = ArticleChanges {
            slug: Some("second".to_string()),
            ..Default::default()
        };
        assert!(store.update_article(second.id, changes).await.is_ok());
    }

    #[tokio::test]
    async fn test_generated_content_keeps_draft_and_clears_error() {
        let store = MemoryStore::new();
        let article = store.insert_article(new_article("a")).await.unwrap();
        store.record_generation_error(article.id, "boom").await.unwrap();

        let updated = store
            .apply_generated_content(article.id, "body".to_string())
            .await
            .unwrap();
        assert_eq!(updated.content, "body");
        assert_eq!(updated.article_status(), ArticleStatus::Draft);
        assert!(updated.generation_error.is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_tags_and_jobs() {
        let store = MemoryStore::new();
        let article = store.insert_article(new_article("a")).await.unwrap();
        let job = store.create_job(article.id, "topic", 3).await.unwrap();

        assert!(store.delete_article(article.id).await.unwrap());
        assert!(store.article_tag_ids(article.id).await.unwrap().is_empty());
        assert!(store.find_job(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_active_job_per_article() {
        let store = MemoryStore::new();
        let article = store.insert_article(new_article("a")).await.unwrap();
        let job = store.create_job(article.id, "topic", 3).await.unwrap();

        let err = assert_err!(store.create_job(article.id, "topic", 3).await);
        assert!(matches!(err, AppError::Conflict { .. }));

        store.mark_job_failed(job.id, "gave up").await.unwrap();
        assert!(store.create_job(article.id, "topic", 3).await.is_ok());
    }

    #[tokio::test]
    async fn test_claim_bounded_by_attempts() {
        let store = MemoryStore::new();
        let article = store.insert_article(new_article("a")).await.unwrap();
        let job = store.create_job(article.id, "topic", 2).await.unwrap();
        let stale = Duration::from_secs(300);

        let claimed = store.claim_job(job.id, stale).await.unwrap().unwrap();
        assert_eq!(claimed.attempt_count, 1);

        // Running and fresh: nobody else may take it
        assert!(store.claim_job(job.id, stale).await.unwrap().is_none());

        store.mark_job_retrying(job.id, "e1", Utc::now()).await.unwrap();
        let claimed = store.claim_job(job.id, stale).await.unwrap().unwrap();
        assert_eq!(claimed.attempt_count, 2);

        store.mark_job_retrying(job.id, "e2", Utc::now()).await.unwrap();
        assert!(store.claim_job(job.id, stale).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_running_job_reclaimed() {
        let store = MemoryStore::new();
        let article = store.insert_article(new_article("a")).await.unwrap();
        let job = store.create_job(article.id, "topic", 3).await.unwrap();

        store.claim_job(job.id, Duration::ZERO).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let reclaimed = store.claim_job(job.id, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(reclaimed.attempt_count, 2);
    }
}
