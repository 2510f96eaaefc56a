//! Generation pipeline error types

use crate::stage::Stage;
use blogforge_common::errors::AppError;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Failure of a single stage invocation
#[derive(Error, Debug)]
pub enum StageError {
    #[error("no command configured for stage {0}")]
    NotConfigured(Stage),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("exited with {}: {stderr}", describe_exit(.code))]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("exited successfully but produced no output")]
    EmptyOutput,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

impl StageError {
    /// Short label used as a metrics dimension
    pub fn reason(&self) -> &'static str {
        match self {
            StageError::NotConfigured(_) => "not_configured",
            StageError::Spawn { .. } => "spawn",
            StageError::NonZeroExit { .. } => "exit_status",
            StageError::Timeout(_) => "timeout",
            StageError::EmptyOutput => "empty_output",
            StageError::Io(_) => "io",
        }
    }
}

/// Failure of one pipeline run for one article
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: StageError,
    },

    #[error("stage {stage} broke the output contract: {message}")]
    Contract { stage: Stage, message: String },

    #[error("article {0} not found")]
    ArticleNotFound(Uuid),

    #[error("pipeline exceeded the maximum run time of {0:?}")]
    RunTimeExceeded(Duration),

    #[error("store error: {0}")]
    Store(#[from] AppError),
}
