//! BlogForge Generation Worker
//!
//! Runs generation jobs from the queue:
//! 1. Receives a job message
//! 2. Runs scrape, analyze, build-prompt and synthesize-article
//! 3. Writes the article content
//! 4. Retries or fails the job
//!
//! Usage:
//!   generation-worker [run]
//!   generation-worker enqueue <article-id> <topic>

use anyhow::{bail, Context};
use blogforge_common::{
    config::{AppConfig, QueueBackend, StorageBackend},
    db::{ArticleStore, DbPool, JobStore, Repository},
    queue::{self, enqueue_generation},
    telemetry, VERSION,
};
use blogforge_generation::{ArticleGenerator, GenerationScheduler, ProcessStageInvoker, SchedulerConfig};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

enum Command {
    Run,
    Enqueue { article_id: Uuid, topic: String },
}

fn parse_args(args: &[String]) -> anyhow::Result<Command> {
    match args.first().map(String::as_str) {
        None | Some("run") => Ok(Command::Run),
        Some("enqueue") => {
            let article_id = args
                .get(1)
                .context("usage: generation-worker enqueue <article-id> <topic>")?;
            let article_id = Uuid::parse_str(article_id)
                .with_context(|| format!("invalid article id '{}'", article_id))?;
            let topic = args[2..].join(" ");
            let topic = if topic.trim().is_empty() {
                blogforge_common::DEFAULT_TOPIC.to_string()
            } else {
                topic.trim().to_string()
            };
            Ok(Command::Enqueue { article_id, topic })
        }
        Some(other) => bail!("unknown command '{}'; expected 'run' or 'enqueue'", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load().context("failed to load configuration")?;
    let config = Arc::new(config);

    // Initialize tracing
    let _telemetry = telemetry::init(&config.observability)?;

    info!("Starting BlogForge Generation Worker v{}", VERSION);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;

    // A separate worker process only makes sense with shared state
    if config.database.backend != StorageBackend::Postgres {
        bail!("generation-worker requires database.backend = \"postgres\"");
    }
    if config.queue.backend != QueueBackend::Sqs {
        bail!("generation-worker requires queue.backend = \"sqs\"");
    }

    // Initialize database connection
    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;
    if config.database.run_migrations {
        db.migrate().await?;
    }
    let repository = Arc::new(Repository::new(db));

    let job_queue = queue::connect(&config.queue, config.generation.max_run_time()).await?;

    match command {
        Command::Enqueue { article_id, topic } => {
            if repository.find_article(article_id).await?.is_none() {
                bail!("article {} not found", article_id);
            }

            let job = enqueue_generation(
                repository.as_ref(),
                job_queue.as_ref(),
                article_id,
                &topic,
                config.generation.max_attempts,
            )
            .await?;

            println!("{}", job.id);
            Ok(())
        }
        Command::Run => {
            telemetry::install_metrics_exporter(
                &config.server.host,
                config.observability.metrics_port,
            )?;

            let invoker = Arc::new(ProcessStageInvoker::from_config(&config.generation));
            let articles: Arc<dyn ArticleStore> = repository.clone();
            let jobs: Arc<dyn JobStore> = repository;

            let generator = Arc::new(ArticleGenerator::new(invoker, articles.clone()));
            let scheduler = Arc::new(GenerationScheduler::new(
                generator,
                articles,
                jobs,
                job_queue,
                SchedulerConfig::from(&config.generation),
            ));

            info!(
                scripts_dir = %config.generation.scripts_dir.display(),
                workers = config.generation.workers,
                max_attempts = config.generation.max_attempts,
                "Generation worker ready, starting queue polling..."
            );

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let pool = tokio::spawn(scheduler.run(shutdown_rx));

            shutdown_signal().await;
            shutdown_tx.send(true).ok();
            pool.await.context("worker pool task failed")?;

            info!("Generation worker shutting down");
            Ok(())
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_command_is_run() {
        assert!(matches!(parse_args(&[]).unwrap(), Command::Run));
        assert!(matches!(parse_args(&args(&["run"])).unwrap(), Command::Run));
    }

    #[test]
    fn test_enqueue_joins_topic_words() {
        let id = Uuid::new_v4().to_string();
        match parse_args(&args(&["enqueue", &id, "rust", "ownership"])).unwrap() {
            Command::Enqueue { topic, .. } => assert_eq!(topic, "rust ownership"),
            Command::Run => panic!("expected enqueue"),
        }
    }

    #[test]
    fn test_enqueue_blank_topic_uses_default() {
        let id = Uuid::new_v4().to_string();
        match parse_args(&args(&["enqueue", &id])).unwrap() {
            Command::Enqueue { topic, .. } => assert_eq!(topic, "default"),
            Command::Run => panic!("expected enqueue"),
        }
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(parse_args(&args(&["enqueue", "not-a-uuid", "rust"])).is_err());
        assert!(parse_args(&args(&["enqueue"])).is_err());
        assert!(parse_args(&args(&["explode"])).is_err());
    }
}
