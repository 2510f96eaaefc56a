//! BlogForge Common Library
//!
//! Shared code for the BlogForge services including:
//! - Article and generation job models, repository and in-memory store
//! - Slug allocation
//! - Generation job queue (in-memory and SQS)
//! - Error types and handling
//! - Configuration management
//! - Authentication context
//! - Metrics, logging and tracing setup

pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod metrics;
pub mod queue;
pub mod slug;
pub mod telemetry;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::{ArticleStore, JobStore, MemoryStore, Repository};
pub use errors::{AppError, Result};
pub use queue::{Delivery, GenerationJobMessage, JobQueue};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Keyword used when an article is requested without a topic
pub const DEFAULT_TOPIC: &str = "default";
