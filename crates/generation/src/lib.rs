//! BlogForge generation pipeline
//!
//! Turns a topic into article content by running four external stages in
//! sequence, off the request path:
//! 1. Scrape search results for the topic
//! 2. Analyze the scraped pages
//! 3. Build a writing prompt from the analysis
//! 4. Synthesize the article body from the prompt
//!
//! The [`scheduler`] pulls jobs from the queue, bounds retries and records
//! terminal failures on the article.

pub mod contract;
pub mod errors;
pub mod pipeline;
pub mod scheduler;
pub mod stage;

pub use errors::{GenerationError, StageError};
pub use pipeline::{ArticleGenerator, PipelineState};
pub use scheduler::{GenerationScheduler, JobOutcome, SchedulerConfig};
pub use stage::{ProcessStageInvoker, Stage, StageCommand, StageInvoker};
