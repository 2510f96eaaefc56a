//! SeaORM entity models
//!
//! Database entities for BlogForge

mod article;
mod article_tag;
mod generation_job;

pub use article::{
    Entity as ArticleEntity,
    Model as Article,
    ActiveModel as ArticleActiveModel,
    Column as ArticleColumn,
    ArticleEvent,
    ArticleStatus,
    GenerationState,
};

pub use article_tag::{
    Entity as ArticleTagEntity,
    Model as ArticleTag,
    ActiveModel as ArticleTagActiveModel,
    Column as ArticleTagColumn,
};

pub use generation_job::{
    Entity as GenerationJobEntity,
    Model as GenerationJob,
    ActiveModel as GenerationJobActiveModel,
    Column as GenerationJobColumn,
    JobStatus,
};
