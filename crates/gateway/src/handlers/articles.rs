//! Article management handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::jobs::JobResponse;
use crate::services::CreateArticle;
use crate::AppState;
use blogforge_common::{
    auth::AuthContext,
    db::models::{Article, ArticleStatus, GenerationState},
    db::ArticleChanges,
    errors::{AppError, Result},
};

/// Request to create a new article
#[derive(Debug, Deserialize, Validate)]
pub struct CreateArticleRequest {
    #[validate(nested)]
    pub article: ArticleInput,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct ArticleInput {
    /// Falls back to a title derived from the topic
    #[validate(length(max = 255))]
    pub title: Option<String>,

    /// Keyword handed to the generation pipeline
    #[validate(length(max = 255))]
    pub topic: Option<String>,

    /// Explicit slug; never suffixed, so a collision is rejected
    #[validate(length(max = 255))]
    pub slug: Option<String>,

    /// Content written by hand; skips generation when present
    pub content: Option<String>,

    pub category_id: Option<Uuid>,

    pub supervisor_id: Option<Uuid>,

    #[serde(default)]
    pub tag_ids: Vec<Uuid>,

    #[validate(length(max = 60))]
    pub meta_title: Option<String>,

    #[validate(length(max = 160))]
    pub meta_description: Option<String>,

    #[validate(url)]
    pub featured_image_url: Option<String>,
}

impl From<ArticleInput> for CreateArticle {
    fn from(input: ArticleInput) -> Self {
        Self {
            title: input.title,
            topic: input.topic,
            slug: input.slug,
            content: input.content,
            category_id: input.category_id,
            supervisor_id: input.supervisor_id,
            tag_ids: input.tag_ids,
            meta_title: input.meta_title,
            meta_description: input.meta_description,
            featured_image_url: input.featured_image_url,
        }
    }
}

/// Request to edit an article. Omitted fields stay as they are; `null`
/// clears an optional field.
#[derive(Debug, Deserialize, Validate)]
pub struct UpdateArticleRequest {
    #[validate(nested)]
    pub article: ArticlePatch,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct ArticlePatch {
    #[validate(length(min = 1, max = 255))]
    pub title: Option<String>,

    #[validate(length(min = 1, max = 255))]
    pub slug: Option<String>,

    pub content: Option<String>,

    #[serde(default, deserialize_with = "nullable")]
    pub category_id: Option<Option<Uuid>>,

    #[serde(default, deserialize_with = "nullable")]
    pub supervisor_id: Option<Option<Uuid>>,

    pub tag_ids: Option<Vec<Uuid>>,

    #[serde(default, deserialize_with = "nullable")]
    pub meta_title: Option<Option<String>>,

    #[serde(default, deserialize_with = "nullable")]
    pub meta_description: Option<Option<String>>,

    #[serde(default, deserialize_with = "nullable")]
    pub featured_image_url: Option<Option<String>>,
}

/// Present-but-null becomes `Some(None)`; absence is handled by `default`
fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn check_length(field: &str, value: &Option<Option<String>>, max: usize) -> Result<()> {
    if let Some(Some(text)) = value {
        if text.chars().count() > max {
            return Err(AppError::Validation {
                message: format!("{} must be at most {} characters", field, max),
                field: Some(field.to_string()),
            });
        }
    }
    Ok(())
}

impl ArticlePatch {
    fn into_changes(self) -> Result<ArticleChanges> {
        check_length("meta_title", &self.meta_title, 60)?;
        check_length("meta_description", &self.meta_description, 160)?;

        Ok(ArticleChanges {
            title: self.title,
            slug: self.slug,
            content: self.content,
            category_id: self.category_id,
            supervisor_id: self.supervisor_id,
            tag_ids: self.tag_ids,
            meta_title: self.meta_title,
            meta_description: self.meta_description,
            featured_image_url: self.featured_image_url,
        })
    }
}

/// Article as returned by the API
#[derive(Debug, Serialize)]
pub struct ArticleResponse {
    pub id: Uuid,
    pub title: String,
    pub slug: String,
    pub content: String,
    pub status: ArticleStatus,
    pub generation_state: GenerationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_error: Option<String>,
    pub user_id: Uuid,
    pub category_id: Option<Uuid>,
    pub supervisor_id: Option<Uuid>,
    pub tag_ids: Vec<Uuid>,
    pub meta_title: Option<String>,
    pub meta_description: Option<String>,
    pub featured_image_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ArticleResponse {
    pub fn new(article: Article, tag_ids: Vec<Uuid>) -> Self {
        Self {
            status: article.article_status(),
            generation_state: article.generation_state(),
            id: article.id,
            title: article.title,
            slug: article.slug,
            content: article.content,
            generation_error: article.generation_error,
            user_id: article.user_id,
            category_id: article.category_id,
            supervisor_id: article.supervisor_id,
            tag_ids,
            meta_title: article.meta_title,
            meta_description: article.meta_description,
            featured_image_url: article.featured_image_url,
            created_at: article.created_at.to_rfc3339(),
            updated_at: article.updated_at.to_rfc3339(),
        }
    }
}

/// Response after creating an article
#[derive(Serialize)]
pub struct CreateArticleResponse {
    pub article: ArticleResponse,
    /// Absent when the content was authored directly
    pub job: Option<JobResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_url: Option<String>,
}

/// Generation progress for one article
#[derive(Serialize)]
pub struct GenerationStatusResponse {
    pub article_id: Uuid,
    pub slug: String,
    pub generation_state: GenerationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_error: Option<String>,
    pub job: Option<JobResponse>,
}

/// Editors may change their own articles; `admin` may change any
fn authorize_edit(auth: &AuthContext, article: &Article) -> Result<()> {
    if article.user_id == auth.user_id || auth.has_scope("admin") {
        Ok(())
    } else {
        Err(AppError::Forbidden {
            message: "Only the owner may modify this article".to_string(),
        })
    }
}

async fn respond(state: &AppState, article: Article) -> Result<Json<ArticleResponse>> {
    let tag_ids = state.articles.tag_ids(&article).await?;
    Ok(Json(ArticleResponse::new(article, tag_ids)))
}

/// Create an article and queue its generation
pub async fn create_article(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<CreateArticleRequest>,
) -> Result<(StatusCode, Json<CreateArticleResponse>)> {
    request.validate()?;

    let created = state
        .articles
        .create(auth.user_id, request.article.into())
        .await?;

    let tag_ids = state.articles.tag_ids(&created.article).await?;
    let status = if created.job.is_some() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CREATED
    };
    let poll_url = created
        .job
        .as_ref()
        .map(|job| format!("/api/v1/jobs/{}", job.id));

    Ok((
        status,
        Json(CreateArticleResponse {
            article: ArticleResponse::new(created.article, tag_ids),
            job: created.job.map(JobResponse::from),
            poll_url,
        }),
    ))
}

/// Get an article by slug. Drafts are only visible to authenticated callers.
pub async fn get_article(
    State(state): State<AppState>,
    auth: Option<AuthContext>,
    Path(slug): Path<String>,
) -> Result<Json<ArticleResponse>> {
    let article = state.articles.get(&slug).await?;

    if !article.is_published() && auth.is_none() {
        return Err(AppError::ArticleNotFound { id: slug });
    }

    respond(&state, article).await
}

/// Edit an article directly, bypassing the pipeline
pub async fn update_article(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(slug): Path<String>,
    Json(request): Json<UpdateArticleRequest>,
) -> Result<Json<ArticleResponse>> {
    request.validate()?;

    let article = state.articles.get(&slug).await?;
    authorize_edit(&auth, &article)?;

    let changes = request.article.into_changes()?;
    let updated = state.articles.update(&slug, changes).await?;

    respond(&state, updated).await
}

/// Delete an article with its tags and jobs
pub async fn delete_article(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(slug): Path<String>,
) -> Result<StatusCode> {
    let article = state.articles.get(&slug).await?;
    authorize_edit(&auth, &article)?;

    state.articles.delete(&slug).await?;

    tracing::info!(
        article_id = %article.id,
        user_id = %auth.user_id,
        request_id = %auth.request_id,
        "Article deleted"
    );

    Ok(StatusCode::NO_CONTENT)
}

/// Publish a draft
pub async fn publish_article(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(slug): Path<String>,
) -> Result<Json<ArticleResponse>> {
    let article = state.articles.get(&slug).await?;
    authorize_edit(&auth, &article)?;

    let published = state.articles.publish(&slug).await?;

    respond(&state, published).await
}

/// Generation progress: derived article state plus the latest job
pub async fn generation_status(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(slug): Path<String>,
) -> Result<Json<GenerationStatusResponse>> {
    let (article, job) = state.articles.generation_status(&slug).await?;
    authorize_edit(&auth, &article)?;

    Ok(Json(GenerationStatusResponse {
        article_id: article.id,
        generation_state: article.generation_state(),
        slug: article.slug,
        generation_error: article.generation_error,
        job: job.map(JobResponse::from),
    }))
}
