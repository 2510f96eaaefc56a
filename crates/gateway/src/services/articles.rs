//! Article lifecycle operations behind the HTTP handlers
//!
//! Creation allocates the slug and, unless content was authored directly,
//! records a generation job and publishes its message. Publishing applies
//! the status transition after the empty-content rule.

use blogforge_common::{
    config::AppConfig,
    db::models::{Article, GenerationJob},
    db::{ArticleChanges, ArticleStore, JobStore, NewArticle},
    errors::{AppError, Result},
    metrics,
    queue::{enqueue_generation, JobQueue},
    slug::{allocate_slug, explicit_slug},
    DEFAULT_TOPIC,
};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Input for a new article. Blank strings count as absent.
#[derive(Debug, Clone, Default)]
pub struct CreateArticle {
    pub title: Option<String>,
    pub topic: Option<String>,
    pub slug: Option<String>,
    pub content: Option<String>,
    pub category_id: Option<Uuid>,
    pub supervisor_id: Option<Uuid>,
    pub tag_ids: Vec<Uuid>,
    pub meta_title: Option<String>,
    pub meta_description: Option<String>,
    pub featured_image_url: Option<String>,
}

/// A created article and, when content is left to the pipeline, its job
#[derive(Debug)]
pub struct CreatedArticle {
    pub article: Article,
    pub job: Option<GenerationJob>,
}

/// Title used when the caller gives only a topic
pub fn fallback_title(topic: &str) -> String {
    format!("{}に関する記事", topic)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Clone)]
pub struct ArticleService {
    articles: Arc<dyn ArticleStore>,
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    max_attempts: u32,
    allow_empty_publish: bool,
}

impl ArticleService {
    pub fn new(
        articles: Arc<dyn ArticleStore>,
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        config: &AppConfig,
    ) -> Self {
        Self {
            articles,
            jobs,
            queue,
            max_attempts: config.generation.max_attempts,
            allow_empty_publish: config.articles.allow_empty_publish,
        }
    }

    /// Create a draft and hand it to the generation pipeline.
    #[instrument(skip(self, input), fields(owner = %owner))]
    pub async fn create(&self, owner: Uuid, input: CreateArticle) -> Result<CreatedArticle> {
        let topic = non_blank(input.topic).unwrap_or_else(|| DEFAULT_TOPIC.to_string());
        let title = non_blank(input.title).unwrap_or_else(|| fallback_title(&topic));

        let slug = match non_blank(input.slug) {
            Some(requested) => {
                let slug = explicit_slug(&requested)?;
                if self.articles.slug_exists(&slug).await? {
                    return Err(AppError::DuplicateSlug { slug });
                }
                slug
            }
            None => allocate_slug(self.articles.as_ref(), &title).await?,
        };

        let authored = non_blank(input.content.clone());

        let article = self
            .articles
            .insert_article(NewArticle {
                user_id: owner,
                title,
                slug,
                content: authored.clone().unwrap_or_default(),
                category_id: input.category_id,
                supervisor_id: input.supervisor_id,
                tag_ids: input.tag_ids,
                meta_title: non_blank(input.meta_title),
                meta_description: non_blank(input.meta_description),
                featured_image_url: non_blank(input.featured_image_url),
            })
            .await?;

        metrics::record_article_created();

        if authored.is_some() {
            info!(article_id = %article.id, slug = %article.slug, "Article authored directly");
            return Ok(CreatedArticle { article, job: None });
        }

        let job = match enqueue_generation(
            self.jobs.as_ref(),
            self.queue.as_ref(),
            article.id,
            &topic,
            self.max_attempts,
        )
        .await
        {
            Ok(job) => job,
            Err(e) => {
                // The draft stays; make the failure visible on it
                self.articles
                    .record_generation_error(article.id, &e.to_string())
                    .await?;
                return Err(e);
            }
        };

        info!(
            article_id = %article.id,
            job_id = %job.id,
            slug = %article.slug,
            topic = %topic,
            "Article created, generation queued"
        );

        Ok(CreatedArticle {
            article,
            job: Some(job),
        })
    }

    pub async fn get(&self, slug: &str) -> Result<Article> {
        self.articles
            .find_article_by_slug(slug)
            .await?
            .ok_or_else(|| AppError::ArticleNotFound {
                id: slug.to_string(),
            })
    }

    pub async fn tag_ids(&self, article: &Article) -> Result<Vec<Uuid>> {
        self.articles.article_tag_ids(article.id).await
    }

    /// Apply direct edits. A new slug is normalized but never suffixed.
    #[instrument(skip(self, changes))]
    pub async fn update(&self, slug: &str, mut changes: ArticleChanges) -> Result<Article> {
        let article = self.get(slug).await?;

        if let Some(title) = changes.title.take() {
            let title = title.trim().to_string();
            if title.is_empty() {
                return Err(AppError::Validation {
                    message: "Title must not be empty".to_string(),
                    field: Some("title".to_string()),
                });
            }
            changes.title = Some(title);
        }

        let empties_content = changes
            .content
            .as_ref()
            .is_some_and(|content| content.trim().is_empty());
        if empties_content && article.is_published() && !self.allow_empty_publish {
            return Err(AppError::Validation {
                message: "A published article cannot have empty content".to_string(),
                field: Some("content".to_string()),
            });
        }

        if let Some(requested) = changes.slug.take() {
            let new_slug = explicit_slug(&requested)?;
            if new_slug != article.slug {
                if self.articles.slug_exists(&new_slug).await? {
                    return Err(AppError::DuplicateSlug { slug: new_slug });
                }
                changes.slug = Some(new_slug);
            }
        }

        if changes.is_empty() {
            return Ok(article);
        }

        let updated = self.articles.update_article(article.id, changes).await?;
        info!(article_id = %updated.id, slug = %updated.slug, "Article updated");
        Ok(updated)
    }

    /// Publish a draft. Idempotent for an already published article.
    #[instrument(skip(self))]
    pub async fn publish(&self, slug: &str) -> Result<Article> {
        let article = self.get(slug).await?;

        if article.is_published() {
            return Ok(article);
        }

        if article.content.trim().is_empty() && !self.allow_empty_publish {
            return Err(AppError::Validation {
                message: "Article has no content yet; wait for generation to complete".to_string(),
                field: Some("content".to_string()),
            });
        }

        let published = self.articles.publish_article(article.id).await?;
        metrics::record_article_published();
        info!(article_id = %published.id, slug = %published.slug, "Article published");
        Ok(published)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, slug: &str) -> Result<()> {
        let article = self.get(slug).await?;

        if !self.articles.delete_article(article.id).await? {
            return Err(AppError::ArticleNotFound {
                id: slug.to_string(),
            });
        }

        info!(article_id = %article.id, slug = %slug, "Article deleted");
        Ok(())
    }

    /// The article with its most recent generation job
    pub async fn generation_status(&self, slug: &str) -> Result<(Article, Option<GenerationJob>)> {
        let article = self.get(slug).await?;
        let job = self.jobs.latest_job_for_article(article.id).await?;
        Ok((article, job))
    }
}
