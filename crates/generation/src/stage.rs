//! Stage runner
//!
//! Each stage is an external program. It receives its input as command-line
//! arguments and answers on stdout. A stage succeeds only when it exits with
//! status 0 *and* prints something; a non-zero exit, a timeout or empty
//! output are all failures. There is no retry at this level.

use crate::errors::StageError;
use async_trait::async_trait;
use blogforge_common::config::GenerationConfig;
use blogforge_common::metrics;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

/// Longest stderr excerpt kept on a failure
const STDERR_LIMIT: usize = 4096;

/// The four pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Scrape,
    Analyze,
    BuildPrompt,
    SynthesizeArticle,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Scrape,
        Stage::Analyze,
        Stage::BuildPrompt,
        Stage::SynthesizeArticle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Scrape => "scrape",
            Stage::Analyze => "analyze",
            Stage::BuildPrompt => "build_prompt",
            Stage::SynthesizeArticle => "synthesize_article",
        }
    }

    /// Script file run for this stage inside the scripts directory
    pub fn script_name(&self) -> &'static str {
        match self {
            Stage::Scrape => "scrape.py",
            Stage::Analyze => "analyze.py",
            Stage::BuildPrompt => "generate_prompt.py",
            Stage::SynthesizeArticle => "generate_article.py",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs one stage and returns its trimmed stdout
#[async_trait]
pub trait StageInvoker: Send + Sync {
    async fn invoke(&self, stage: Stage, args: &[String]) -> Result<String, StageError>;
}

/// Program plus leading arguments for one stage; stage inputs are appended
#[derive(Debug, Clone)]
pub struct StageCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl StageCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

/// [`StageInvoker`] that spawns each stage as a child process
pub struct ProcessStageInvoker {
    commands: HashMap<Stage, StageCommand>,
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl ProcessStageInvoker {
    /// An invoker with no stages configured
    pub fn new(timeout: Duration) -> Self {
        Self {
            commands: HashMap::new(),
            working_dir: None,
            timeout,
        }
    }

    /// `{interpreter} {scripts_dir}/{script}` for every stage
    pub fn from_config(config: &GenerationConfig) -> Self {
        Stage::ALL
            .into_iter()
            .fold(Self::new(config.stage_timeout()), |invoker, stage| {
                let script = config.scripts_dir.join(stage.script_name());
                invoker.with_stage(
                    stage,
                    StageCommand::new(config.interpreter.clone())
                        .with_args(vec![script.to_string_lossy().into_owned()]),
                )
            })
    }

    pub fn with_stage(mut self, stage: Stage, command: StageCommand) -> Self {
        self.commands.insert(stage, command);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    async fn run(&self, stage: Stage, args: &[String]) -> Result<String, StageError> {
        let command = self
            .commands
            .get(&stage)
            .ok_or(StageError::NotConfigured(stage))?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future on timeout kills the child
            .kill_on_drop(true);

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|source| StageError::Spawn {
            program: command.program.clone(),
            source,
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| StageError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StageError::NonZeroExit {
                code: output.status.code(),
                stderr: truncate(stderr.trim(), STDERR_LIMIT),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if stdout.is_empty() {
            return Err(StageError::EmptyOutput);
        }

        Ok(stdout)
    }
}

#[async_trait]
impl StageInvoker for ProcessStageInvoker {
    async fn invoke(&self, stage: Stage, args: &[String]) -> Result<String, StageError> {
        let start = Instant::now();
        let result = self.run(stage, args).await;
        let elapsed = start.elapsed();

        match result {
            Ok(ref output) => {
                debug!(
                    stage = %stage,
                    bytes = output.len(),
                    duration_ms = elapsed.as_millis() as u64,
                    "Stage completed"
                );
                metrics::record_stage(stage.as_str(), elapsed, None);
            }
            Err(ref e) => {
                warn!(
                    stage = %stage,
                    reason = e.reason(),
                    error = %e,
                    duration_ms = elapsed.as_millis() as u64,
                    "Stage failed"
                );
                metrics::record_stage(stage.as_str(), elapsed, Some(e.reason()));
            }
        }

        result
    }
}

/// Cut `text` to at most `max` bytes on a char boundary
pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> StageCommand {
        StageCommand::new("sh").with_args(vec!["-c".to_string(), script.to_string(), "stage".to_string()])
    }

    fn invoker(script: &str, timeout: Duration) -> ProcessStageInvoker {
        ProcessStageInvoker::new(timeout).with_stage(Stage::Scrape, shell(script))
    }

    #[test]
    fn test_from_config_builds_every_stage() {
        let config = GenerationConfig::default();
        let invoker = ProcessStageInvoker::from_config(&config);

        for stage in Stage::ALL {
            let command = &invoker.commands[&stage];
            assert_eq!(command.program, "python3");
            assert!(command.args[0].ends_with(stage.script_name()));
        }
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ああああ", 4), "あ...");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_output_is_trimmed() {
        let out = invoker("echo '  ok  '", Duration::from_secs(5))
            .invoke(Stage::Scrape, &[])
            .await
            .unwrap();
        assert_eq!(out, "ok");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_inputs_passed_as_arguments() {
        let out = invoker(r#"printf '%s|%s' "$1" "$2""#, Duration::from_secs(5))
            .invoke(Stage::Scrape, &["rust ownership".to_string(), "second".to_string()])
            .await
            .unwrap();
        assert_eq!(out, "rust ownership|second");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_empty_output_is_failure() {
        let err = invoker("printf ''", Duration::from_secs(5))
            .invoke(Stage::Scrape, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::EmptyOutput));

        let err = invoker("printf '  \\n'", Duration::from_secs(5))
            .invoke(Stage::Scrape, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::EmptyOutput));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_keeps_stderr() {
        let err = invoker("echo partial; echo broken >&2; exit 3", Duration::from_secs(5))
            .invoke(Stage::Scrape, &[])
            .await
            .unwrap_err();

        match err {
            StageError::NonZeroExit { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_failure() {
        let start = Instant::now();
        let err = invoker("sleep 5; echo late", Duration::from_millis(100))
            .invoke(Stage::Scrape, &[])
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_unconfigured_stage() {
        let err = ProcessStageInvoker::new(Duration::from_secs(1))
            .invoke(Stage::Analyze, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::NotConfigured(Stage::Analyze)));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let err = ProcessStageInvoker::new(Duration::from_secs(1))
            .with_stage(Stage::Scrape, StageCommand::new("/nonexistent/blogforge-stage"))
            .invoke(Stage::Scrape, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Spawn { .. }));
    }
}
