//! Article entity and its status machine

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Visibility of an article
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArticleStatus {
    Draft,
    Published,
}

/// Events that may move an article between statuses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArticleEvent {
    /// Explicit publish action from an editor
    Publish,
    /// The generation pipeline wrote the article content
    PipelineComplete,
}

impl ArticleStatus {
    /// The single transition function for article status.
    ///
    /// Publishing is idempotent. Pipeline completion never publishes.
    /// Content is not consulted here; the publish service owns that rule.
    pub fn transition(self, event: ArticleEvent) -> ArticleStatus {
        match (self, event) {
            (_, ArticleEvent::Publish) => ArticleStatus::Published,
            (status, ArticleEvent::PipelineComplete) => status,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArticleStatus::Draft => "draft",
            ArticleStatus::Published => "published",
        }
    }
}

impl From<String> for ArticleStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "published" => ArticleStatus::Published,
            _ => ArticleStatus::Draft,
        }
    }
}

impl From<ArticleStatus> for String {
    fn from(status: ArticleStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Progress of content generation, derived from the stored row
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    Pending,
    Failed,
    Complete,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "articles")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Creating user
    pub user_id: Uuid,

    pub category_id: Option<Uuid>,

    pub supervisor_id: Option<Uuid>,

    #[sea_orm(column_type = "Text")]
    pub title: String,

    #[sea_orm(column_type = "Text", unique)]
    pub slug: String,

    /// Empty until the generation pipeline completes
    #[sea_orm(column_type = "Text")]
    pub content: String,

    #[sea_orm(column_type = "Text")]
    pub status: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub meta_title: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub meta_description: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub featured_image_url: Option<String>,

    /// Set when generation failed for good, cleared on success
    #[sea_orm(column_type = "Text", nullable)]
    pub generation_error: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn article_status(&self) -> ArticleStatus {
        ArticleStatus::from(self.status.clone())
    }

    pub fn is_published(&self) -> bool {
        self.article_status() == ArticleStatus::Published
    }

    pub fn generation_state(&self) -> GenerationState {
        if self.generation_error.is_some() {
            GenerationState::Failed
        } else if self.content.is_empty() {
            GenerationState::Pending
        } else {
            GenerationState::Complete
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::article_tag::Entity")]
    Tags,

    #[sea_orm(has_many = "super::generation_job::Entity")]
    GenerationJobs,
}

impl Related<super::article_tag::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tags.def()
    }
}

impl Related<super::generation_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::GenerationJobs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_from_any_status() {
        assert_eq!(
            ArticleStatus::Draft.transition(ArticleEvent::Publish),
            ArticleStatus::Published
        );
        assert_eq!(
            ArticleStatus::Published.transition(ArticleEvent::Publish),
            ArticleStatus::Published
        );
    }

    #[test]
    fn test_pipeline_never_publishes() {
        assert_eq!(
            ArticleStatus::Draft.transition(ArticleEvent::PipelineComplete),
            ArticleStatus::Draft
        );
        assert_eq!(
            ArticleStatus::Published.transition(ArticleEvent::PipelineComplete),
            ArticleStatus::Published
        );
    }

    #[test]
    fn test_status_string_mapping() {
        assert_eq!(String::from(ArticleStatus::Published), "published");
        assert_eq!(ArticleStatus::from("draft".to_string()), ArticleStatus::Draft);
        assert_eq!(ArticleStatus::from("bogus".to_string()), ArticleStatus::Draft);
    }
}
