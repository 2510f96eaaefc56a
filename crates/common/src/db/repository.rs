//! Repository pattern for database operations
//!
//! PostgreSQL implementation of the article and job stores. Uniqueness of
//! slugs and of active jobs per article is left to the database indexes;
//! violations are mapped onto the matching [`AppError`] variants.

use crate::db::models::*;
use crate::db::store::{ArticleChanges, ArticleStore, JobStore, NewArticle};
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbBackend, DbErr, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, Statement, TransactionTrait,
};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get the read connection
    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    /// Get the write connection
    fn write_conn(&self) -> &DatabaseConnection {
        self.pool.write()
    }

    /// Articles are read back from the primary after writes to avoid
    /// replica lag surfacing stale rows to the pipeline.
    async fn load_article_for_write(&self, id: Uuid) -> Result<Article> {
        ArticleEntity::find_by_id(id)
            .one(self.write_conn())
            .await?
            .ok_or_else(|| AppError::ArticleNotFound { id: id.to_string() })
    }

    async fn load_job_for_write(&self, id: Uuid) -> Result<GenerationJob> {
        GenerationJobEntity::find_by_id(id)
            .one(self.write_conn())
            .await?
            .ok_or_else(|| AppError::JobNotFound { id: id.to_string() })
    }
}

fn active_job_conflict(err: DbErr, article_id: Uuid) -> AppError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => AppError::Conflict {
            message: format!("Article {} already has an active generation job", article_id),
        },
        Some(SqlErr::ForeignKeyConstraintViolation(_)) => AppError::ArticleNotFound {
            id: article_id.to_string(),
        },
        _ => AppError::Database(err),
    }
}

// ============================================================================
// Article Operations
// ============================================================================

#[async_trait]
impl ArticleStore for Repository {
    async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    async fn slug_exists(&self, slug: &str) -> Result<bool> {
        let found = ArticleEntity::find()
            .filter(ArticleColumn::Slug.eq(slug))
            .one(self.write_conn())
            .await?;
        Ok(found.is_some())
    }

    async fn insert_article(&self, new: NewArticle) -> Result<Article> {
        let now = Utc::now();
        let slug = new.slug.clone();

        let txn = self.write_conn().begin().await?;

        let article = ArticleActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(new.user_id),
            category_id: Set(new.category_id),
            supervisor_id: Set(new.supervisor_id),
            title: Set(new.title),
            slug: Set(new.slug),
            content: Set(new.content),
            status: Set(ArticleStatus::Draft.into()),
            meta_title: Set(new.meta_title),
            meta_description: Set(new.meta_description),
            featured_image_url: Set(new.featured_image_url),
            generation_error: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        }
        .insert(&txn)
        .await
        .map_err(|e| AppError::from_slug_write(e, &slug))?;

        if !new.tag_ids.is_empty() {
            let rows = new.tag_ids.into_iter().map(|tag_id| ArticleTagActiveModel {
                article_id: Set(article.id),
                tag_id: Set(tag_id),
            });
            ArticleTagEntity::insert_many(rows)
                .exec_without_returning(&txn)
                .await?;
        }

        txn.commit().await?;

        debug!(article_id = %article.id, slug = %article.slug, "Article inserted");
        Ok(article)
    }

    async fn find_article(&self, id: Uuid) -> Result<Option<Article>> {
        ArticleEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    async fn find_article_by_slug(&self, slug: &str) -> Result<Option<Article>> {
        ArticleEntity::find()
            .filter(ArticleColumn::Slug.eq(slug))
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    async fn article_tag_ids(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let rows = ArticleTagEntity::find()
            .filter(ArticleTagColumn::ArticleId.eq(id))
            .all(self.read_conn())
            .await?;
        Ok(rows.into_iter().map(|r| r.tag_id).collect())
    }

    async fn update_article(&self, id: Uuid, changes: ArticleChanges) -> Result<Article> {
        let txn = self.write_conn().begin().await?;

        let mut article: ArticleActiveModel = ArticleEntity::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or_else(|| AppError::ArticleNotFound { id: id.to_string() })?
            .into();

        let slug = changes.slug.clone();
        if let Some(title) = changes.title {
            article.title = Set(title);
        }
        if let Some(slug) = changes.slug {
            article.slug = Set(slug);
        }
        if let Some(content) = changes.content {
            article.content = Set(content);
        }
        if let Some(category_id) = changes.category_id {
            article.category_id = Set(category_id);
        }
        if let Some(supervisor_id) = changes.supervisor_id {
            article.supervisor_id = Set(supervisor_id);
        }
        if let Some(meta_title) = changes.meta_title {
            article.meta_title = Set(meta_title);
        }
        if let Some(meta_description) = changes.meta_description {
            article.meta_description = Set(meta_description);
        }
        if let Some(url) = changes.featured_image_url {
            article.featured_image_url = Set(url);
        }
        article.updated_at = Set(Utc::now().into());

        let updated = article.update(&txn).await.map_err(|e| match slug {
            Some(ref slug) => AppError::from_slug_write(e, slug),
            None => AppError::Database(e),
        })?;

        if let Some(tag_ids) = changes.tag_ids {
            ArticleTagEntity::delete_many()
                .filter(ArticleTagColumn::ArticleId.eq(id))
                .exec(&txn)
                .await?;

            if !tag_ids.is_empty() {
                let rows = tag_ids.into_iter().map(|tag_id| ArticleTagActiveModel {
                    article_id: Set(id),
                    tag_id: Set(tag_id),
                });
                ArticleTagEntity::insert_many(rows)
                .exec_without_returning(&txn)
                .await?;
            }
        }

        txn.commit().await?;
        Ok(updated)
    }

    async fn apply_generated_content(&self, id: Uuid, content: String) -> Result<Article> {
        let current = self.load_article_for_write(id).await?;
        let status = current
            .article_status()
            .transition(ArticleEvent::PipelineComplete);

        let mut article: ArticleActiveModel = current.into();
        article.content = Set(content);
        article.status = Set(status.into());
        article.generation_error = Set(None);
        article.updated_at = Set(Utc::now().into());

        article.update(self.write_conn()).await.map_err(Into::into)
    }

    async fn record_generation_error(&self, id: Uuid, error: &str) -> Result<()> {
        let mut article: ArticleActiveModel = self.load_article_for_write(id).await?.into();
        article.generation_error = Set(Some(error.to_string()));
        article.updated_at = Set(Utc::now().into());
        article.update(self.write_conn()).await?;
        Ok(())
    }

    async fn publish_article(&self, id: Uuid) -> Result<Article> {
        let current = self.load_article_for_write(id).await?;
        let status = current.article_status().transition(ArticleEvent::Publish);

        let mut article: ArticleActiveModel = current.into();
        article.status = Set(status.into());
        article.updated_at = Set(Utc::now().into());

        article.update(self.write_conn()).await.map_err(Into::into)
    }

    async fn delete_article(&self, id: Uuid) -> Result<bool> {
        // Tag rows and jobs go with it through ON DELETE CASCADE
        let result = ArticleEntity::delete_by_id(id)
            .exec(self.write_conn())
            .await?;

        Ok(result.rows_affected > 0)
    }
}

// ============================================================================
// Job Operations
// ============================================================================

#[async_trait]
impl JobStore for Repository {
    async fn create_job(
        &self,
        article_id: Uuid,
        topic: &str,
        max_attempts: u32,
    ) -> Result<GenerationJob> {
        let now = Utc::now();

        let job = GenerationJobActiveModel {
            id: Set(Uuid::new_v4()),
            article_id: Set(article_id),
            topic: Set(topic.to_string()),
            status: Set(JobStatus::Queued.into()),
            attempt_count: Set(0),
            max_attempts: Set(max_attempts as i32),
            last_error: Set(None),
            next_retry_at: Set(None),
            created_at: Set(now.into()),
            started_at: Set(None),
            completed_at: Set(None),
            updated_at: Set(now.into()),
        };

        job.insert(self.write_conn())
            .await
            .map_err(|e| active_job_conflict(e, article_id))
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<GenerationJob>> {
        GenerationJobEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    async fn latest_job_for_article(&self, article_id: Uuid) -> Result<Option<GenerationJob>> {
        GenerationJobEntity::find()
            .filter(GenerationJobColumn::ArticleId.eq(article_id))
            .order_by_desc(GenerationJobColumn::CreatedAt)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    async fn claim_job(&self, id: Uuid, stale_after: Duration) -> Result<Option<GenerationJob>> {
        // Single statement so two workers can never both win the same attempt
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            UPDATE generation_jobs
            SET status = 'running',
                attempt_count = attempt_count + 1,
                started_at = NOW(),
                next_retry_at = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND attempt_count < max_attempts
              AND (
                status = 'queued'
                OR (status = 'running' AND started_at < NOW() - make_interval(secs => $2))
              )
            RETURNING *
            "#,
            vec![id.into(), stale_after.as_secs_f64().into()],
        );

        GenerationJobEntity::find()
            .from_raw_sql(stmt)
            .one(self.write_conn())
            .await
            .map_err(Into::into)
    }

    async fn mark_job_succeeded(&self, id: Uuid) -> Result<GenerationJob> {
        let now = Utc::now();
        let mut job: GenerationJobActiveModel = self.load_job_for_write(id).await?.into();
        job.status = Set(JobStatus::Succeeded.into());
        job.last_error = Set(None);
        job.completed_at = Set(Some(now.into()));
        job.updated_at = Set(now.into());
        job.update(self.write_conn()).await.map_err(Into::into)
    }

    async fn mark_job_retrying(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<GenerationJob> {
        let mut job: GenerationJobActiveModel = self.load_job_for_write(id).await?.into();
        job.status = Set(JobStatus::Queued.into());
        job.last_error = Set(Some(error.to_string()));
        job.next_retry_at = Set(Some(next_retry_at.into()));
        job.updated_at = Set(Utc::now().into());
        job.update(self.write_conn()).await.map_err(Into::into)
    }

    async fn mark_job_failed(&self, id: Uuid, error: &str) -> Result<GenerationJob> {
        let now = Utc::now();
        let mut job: GenerationJobActiveModel = self.load_job_for_write(id).await?.into();
        job.status = Set(JobStatus::Failed.into());
        job.last_error = Set(Some(error.to_string()));
        job.next_retry_at = Set(None);
        job.completed_at = Set(Some(now.into()));
        job.updated_at = Set(now.into());
        job.update(self.write_conn()).await.map_err(Into::into)
    }

    async fn list_failed_jobs(&self, limit: u64) -> Result<Vec<GenerationJob>> {
        GenerationJobEntity::find()
            .filter(GenerationJobColumn::Status.eq(String::from(JobStatus::Failed)))
            .order_by_desc(GenerationJobColumn::UpdatedAt)
            .limit(limit)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }
}
