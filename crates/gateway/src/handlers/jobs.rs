//! Generation job handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;
use blogforge_common::{
    auth::AuthContext,
    db::models::{GenerationJob, JobStatus},
    errors::{AppError, Result},
};

const DEFAULT_FAILED_LIMIT: u64 = 50;
const MAX_FAILED_LIMIT: u64 = 200;

/// Job status response
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: Uuid,
    pub article_id: Uuid,
    pub topic: String,
    pub status: JobStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    pub created_at: String,
}

impl From<GenerationJob> for JobResponse {
    fn from(job: GenerationJob) -> Self {
        Self {
            status: job.job_status(),
            job_id: job.id,
            article_id: job.article_id,
            topic: job.topic,
            attempt_count: job.attempt_count,
            max_attempts: job.max_attempts,
            last_error: job.last_error,
            next_retry_at: job.next_retry_at.map(|dt| dt.to_rfc3339()),
            started_at: job.started_at.map(|dt| dt.to_rfc3339()),
            completed_at: job.completed_at.map(|dt| dt.to_rfc3339()),
            created_at: job.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FailedJobsQuery {
    pub limit: Option<u64>,
}

#[derive(Serialize)]
pub struct FailedJobsResponse {
    pub jobs: Vec<JobResponse>,
}

/// Get job status
pub async fn get_job(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobResponse>> {
    let job = state
        .jobs
        .find_job(job_id)
        .await?
        .ok_or_else(|| AppError::JobNotFound {
            id: job_id.to_string(),
        })?;

    // Verify ownership through the article
    if !auth.has_scope("admin") {
        let owner = state
            .store
            .find_article(job.article_id)
            .await?
            .map(|article| article.user_id);
        if owner != Some(auth.user_id) {
            return Err(AppError::JobNotFound {
                id: job_id.to_string(),
            });
        }
    }

    Ok(Json(JobResponse::from(job)))
}

/// Jobs that exhausted their attempts, most recent first
pub async fn list_failed_jobs(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(query): Query<FailedJobsQuery>,
) -> Result<Json<FailedJobsResponse>> {
    auth.require_scope("admin")?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_FAILED_LIMIT)
        .clamp(1, MAX_FAILED_LIMIT);

    let jobs = state.jobs.list_failed_jobs(limit).await?;

    Ok(Json(FailedJobsResponse {
        jobs: jobs.into_iter().map(JobResponse::from).collect(),
    }))
}
