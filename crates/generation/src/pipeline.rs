//! Pipeline orchestrator
//!
//! Drives one article through `Scraping -> Analyzing -> PromptBuilding ->
//! ArticleSynthesis -> Done`. Every state runs one stage whose stdout is the
//! next stage's input. The first failure aborts the run and nothing is
//! written; on success the article content is written once, at the end.

use crate::contract;
use crate::errors::GenerationError;
use crate::stage::{truncate, Stage, StageInvoker};
use blogforge_common::db::models::Article;
use blogforge_common::db::ArticleStore;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Longest payload excerpt written to the log on a contract failure
const PAYLOAD_LOG_LIMIT: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Scraping,
    Analyzing,
    PromptBuilding,
    ArticleSynthesis,
    Done,
}

impl PipelineState {
    /// Stage run in this state; `None` once done
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineState::Scraping => Some(Stage::Scrape),
            PipelineState::Analyzing => Some(Stage::Analyze),
            PipelineState::PromptBuilding => Some(Stage::BuildPrompt),
            PipelineState::ArticleSynthesis => Some(Stage::SynthesizeArticle),
            PipelineState::Done => None,
        }
    }

    pub fn next(&self) -> PipelineState {
        match self {
            PipelineState::Scraping => PipelineState::Analyzing,
            PipelineState::Analyzing => PipelineState::PromptBuilding,
            PipelineState::PromptBuilding => PipelineState::ArticleSynthesis,
            PipelineState::ArticleSynthesis | PipelineState::Done => PipelineState::Done,
        }
    }
}

/// Runs the stages for one article and stores the result
pub struct ArticleGenerator {
    invoker: Arc<dyn StageInvoker>,
    articles: Arc<dyn ArticleStore>,
}

impl ArticleGenerator {
    pub fn new(invoker: Arc<dyn StageInvoker>, articles: Arc<dyn ArticleStore>) -> Self {
        Self { invoker, articles }
    }

    /// Generate content for `article_id` from `topic`.
    ///
    /// The article keeps its status; publishing stays a separate action.
    #[instrument(skip(self), fields(article_id = %article_id))]
    pub async fn generate(&self, article_id: Uuid, topic: &str) -> Result<Article, GenerationError> {
        if self.articles.find_article(article_id).await?.is_none() {
            return Err(GenerationError::ArticleNotFound(article_id));
        }

        let mut state = PipelineState::Scraping;
        let mut payload = topic.to_string();

        while let Some(stage) = state.stage() {
            let output = self
                .invoker
                .invoke(stage, std::slice::from_ref(&payload))
                .await
                .map_err(|source| GenerationError::Stage { stage, source })?;

            check_contract(stage, &output)?;

            payload = output;
            state = state.next();
        }

        let article = self
            .articles
            .apply_generated_content(article_id, payload)
            .await?;

        info!(
            slug = %article.slug,
            content_bytes = article.content.len(),
            "Article content generated"
        );
        Ok(article)
    }
}

/// Validate JSON-producing stages; text stages pass through
fn check_contract(stage: Stage, output: &str) -> Result<(), GenerationError> {
    let parsed = match stage {
        Stage::Scrape => contract::parse_search_hits(output).map(|_| ()),
        Stage::Analyze => contract::parse_analysis(output).map(|_| ()),
        Stage::BuildPrompt | Stage::SynthesizeArticle => Ok(()),
    };

    parsed.map_err(|e| {
        error!(
            stage = %stage,
            contract_version = contract::CONTRACT_VERSION,
            error = %e,
            payload = %truncate(output, PAYLOAD_LOG_LIMIT),
            "Stage output violates the inter-stage contract"
        );
        GenerationError::Contract {
            stage,
            message: e.to_string(),
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio_test::assert_err;
    use crate::errors::StageError;
    use async_trait::async_trait;
    use blogforge_common::db::models::ArticleStatus;
    use blogforge_common::db::{MemoryStore, NewArticle};
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub(crate) const SCRAPE_OK: &str = r#"[{"Keyword": "rust", "Rank": 1, "Title": "Rust", "URL": "https://example.com"}]"#;
    pub(crate) const ANALYSIS_OK: &str = r#"{"target_keyword": "rust", "average_word_count": 1200}"#;

    /// Scripted invoker: canned output per stage, records every call
    #[derive(Default)]
    pub(crate) struct ScriptedInvoker {
        outputs: HashMap<Stage, String>,
        failing: Option<Stage>,
        pub calls: Mutex<Vec<(Stage, Vec<String>)>>,
    }

    impl ScriptedInvoker {
        pub(crate) fn happy() -> Self {
            let mut outputs = HashMap::new();
            outputs.insert(Stage::Scrape, SCRAPE_OK.to_string());
            outputs.insert(Stage::Analyze, ANALYSIS_OK.to_string());
            outputs.insert(Stage::BuildPrompt, "Write about rust".to_string());
            outputs.insert(Stage::SynthesizeArticle, "# Rust\n\nBody".to_string());
            Self {
                outputs,
                ..Default::default()
            }
        }

        pub(crate) fn failing_at(stage: Stage) -> Self {
            Self {
                failing: Some(stage),
                ..Self::happy()
            }
        }

        pub(crate) fn with_output(mut self, stage: Stage, output: &str) -> Self {
            self.outputs.insert(stage, output.to_string());
            self
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl StageInvoker for ScriptedInvoker {
        async fn invoke(&self, stage: Stage, args: &[String]) -> Result<String, StageError> {
            self.calls.lock().unwrap().push((stage, args.to_vec()));
            if self.failing == Some(stage) {
                return Err(StageError::NonZeroExit {
                    code: Some(1),
                    stderr: "scripted failure".to_string(),
                });
            }
            self.outputs.get(&stage).cloned().ok_or(StageError::EmptyOutput)
        }
    }

    pub(crate) async fn draft(store: &MemoryStore) -> Article {
        draft_with_slug(store, "rust-ownershipに関する記事").await
    }

    pub(crate) async fn draft_with_slug(store: &MemoryStore, slug: &str) -> Article {
        store
            .insert_article(NewArticle {
                user_id: Uuid::new_v4(),
                title: "rust ownershipに関する記事".to_string(),
                slug: slug.to_string(),
                content: String::new(),
                category_id: None,
                supervisor_id: None,
                tag_ids: vec![],
                meta_title: None,
                meta_description: None,
                featured_image_url: None,
            })
            .await
            .unwrap()
    }

    #[test]
    fn test_state_order() {
        let mut state = PipelineState::Scraping;
        let mut stages = Vec::new();
        while let Some(stage) = state.stage() {
            stages.push(stage);
            state = state.next();
        }
        assert_eq!(stages, Stage::ALL.to_vec());
        assert_eq!(PipelineState::Done.next(), PipelineState::Done);
    }

    #[tokio::test]
    async fn test_success_threads_output_and_keeps_draft() {
        let store = Arc::new(MemoryStore::new());
        let invoker = Arc::new(ScriptedInvoker::happy());
        let article = draft(&store).await;

        let generator = ArticleGenerator::new(invoker.clone(), store.clone());
        let updated = generator.generate(article.id, "rust ownership").await.unwrap();

        assert_eq!(updated.content, "# Rust\n\nBody");
        assert_eq!(updated.article_status(), ArticleStatus::Draft);

        let calls = invoker.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0].1, vec!["rust ownership".to_string()]);
        assert_eq!(calls[1].1, vec![SCRAPE_OK.to_string()]);
        assert_eq!(calls[2].1, vec![ANALYSIS_OK.to_string()]);
        assert_eq!(calls[3].1, vec!["Write about rust".to_string()]);
    }

    #[tokio::test]
    async fn test_any_stage_failure_leaves_content_untouched() {
        for (index, stage) in Stage::ALL.into_iter().enumerate() {
            let store = Arc::new(MemoryStore::new());
            let invoker = Arc::new(ScriptedInvoker::failing_at(stage));
            let article = draft(&store).await;

            let generator = ArticleGenerator::new(invoker.clone(), store.clone());
            let err = assert_err!(generator.generate(article.id, "rust").await);

            assert!(matches!(err, GenerationError::Stage { stage: s, .. } if s == stage));
            assert_eq!(invoker.call_count(), index + 1, "stopped at the failing stage");

            let stored = store.find_article(article.id).await.unwrap().unwrap();
            assert_eq!(stored.content, "");
        }
    }

    #[tokio::test]
    async fn test_unparseable_scrape_output_is_contract_error() {
        let store = Arc::new(MemoryStore::new());
        let invoker = Arc::new(ScriptedInvoker::happy().with_output(Stage::Scrape, "<html>oops</html>"));
        let article = draft(&store).await;

        let generator = ArticleGenerator::new(invoker.clone(), store.clone());
        let err = assert_err!(generator.generate(article.id, "rust").await);

        assert!(matches!(err, GenerationError::Contract { stage: Stage::Scrape, .. }));
        assert_eq!(invoker.call_count(), 1);
        assert_eq!(store.find_article(article.id).await.unwrap().unwrap().content, "");
    }

    #[tokio::test]
    async fn test_analysis_without_keyword_is_contract_error() {
        let store = Arc::new(MemoryStore::new());
        let invoker = Arc::new(ScriptedInvoker::happy().with_output(Stage::Analyze, r#"{"average_word_count": 3}"#));
        let article = draft(&store).await;

        let generator = ArticleGenerator::new(invoker, store.clone());
        let err = assert_err!(generator.generate(article.id, "rust").await);
        assert!(matches!(err, GenerationError::Contract { stage: Stage::Analyze, .. }));
    }

    #[tokio::test]
    async fn test_missing_article() {
        let store = Arc::new(MemoryStore::new());
        let invoker = Arc::new(ScriptedInvoker::happy());

        let generator = ArticleGenerator::new(invoker.clone(), store);
        let err = assert_err!(generator.generate(Uuid::new_v4(), "rust").await);

        assert!(matches!(err, GenerationError::ArticleNotFound(_)));
        assert_eq!(invoker.call_count(), 0);
    }
}
