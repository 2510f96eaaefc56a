pub mod articles;

pub use articles::{ArticleService, CreateArticle, CreatedArticle};
