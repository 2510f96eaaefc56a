//! BlogForge API Gateway
//!
//! The main entry point for all external API requests.
//! Handles:
//! - Authentication
//! - Article creation, edits, publishing and deletion
//! - Queueing article generation
//! - Observability (logging, metrics, tracing)
//!
//! With `generation.embedded_worker` the generation worker pool runs in
//! this process as well; that is the only way jobs get processed with the
//! in-memory queue.

mod handlers;
mod middleware;
mod services;

use anyhow::Context;
use axum::{
    routing::{get, post},
    Extension, Router,
};
use blogforge_common::{
    auth::JwtManager,
    config::{AppConfig, AuthConfig, QueueBackend, StorageBackend},
    db::{ArticleStore, DbPool, JobStore, MemoryStore, Repository},
    queue::{self, JobQueue},
    telemetry, VERSION,
};
use blogforge_generation::{
    ArticleGenerator, GenerationScheduler, ProcessStageInvoker, SchedulerConfig,
};
use services::ArticleService;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub articles: ArticleService,
    pub store: Arc<dyn ArticleStore>,
    pub jobs: Arc<dyn JobStore>,
}

impl AppState {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn ArticleStore>,
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        let articles = ArticleService::new(store.clone(), jobs.clone(), queue, config);
        Self {
            articles,
            store,
            jobs,
        }
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

    info!("Starting BlogForge API Gateway v{}", VERSION);

    // Initialize metrics
    telemetry::install_metrics_exporter(&config.server.host, config.observability.metrics_port)?;

    // Initialize storage
    let (store, jobs): (Arc<dyn ArticleStore>, Arc<dyn JobStore>) = match config.database.backend {
        StorageBackend::Memory => {
            warn!("Using in-memory storage; articles are lost on restart");
            let memory = Arc::new(MemoryStore::new());
            (memory.clone(), memory)
        }
        StorageBackend::Postgres => {
            info!("Connecting to database...");
            let db = DbPool::new(&config.database).await?;
            if config.database.run_migrations {
                db.migrate().await?;
            }
            let repository = Arc::new(Repository::new(db));
            (repository.clone(), repository)
        }
    };

    let job_queue = queue::connect(&config.queue, config.generation.max_run_time()).await?;
    let jwt = Arc::new(jwt_manager(&config.auth)?);

    // Embedded worker pool
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = if config.generation.embedded_worker {
        Some(spawn_worker_pool(
            &config,
            store.clone(),
            jobs.clone(),
            job_queue.clone(),
            shutdown_rx,
        ))
    } else {
        if config.queue.backend == QueueBackend::Memory {
            warn!("In-memory queue without embedded worker: generation jobs will never run");
        }
        None
    };

    // Create app state
    let state = AppState::new(&config, store, jobs, job_queue);

    // Build the router
    let app = create_router(state, jwt, config.request_timeout());

    // Start the server
    let addr = (config.server.host.as_str(), config.server.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}:{}", addr.0, addr.1))?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop intake, let in-flight jobs finish
    shutdown_tx.send(true).ok();
    if let Some(pool) = pool {
        match tokio::time::timeout(config.shutdown_timeout(), pool).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Worker pool task failed"),
            Err(_) => warn!("Worker pool did not stop within the shutdown timeout"),
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

fn spawn_worker_pool(
    config: &AppConfig,
    store: Arc<dyn ArticleStore>,
    jobs: Arc<dyn JobStore>,
    job_queue: Arc<dyn JobQueue>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let invoker = Arc::new(ProcessStageInvoker::from_config(&config.generation));
    let generator = Arc::new(ArticleGenerator::new(invoker, store.clone()));
    let scheduler = Arc::new(GenerationScheduler::new(
        generator,
        store,
        jobs,
        job_queue,
        SchedulerConfig::from(&config.generation),
    ));

    info!(
        scripts_dir = %config.generation.scripts_dir.display(),
        workers = config.generation.workers,
        "Starting embedded generation worker pool"
    );

    tokio::spawn(scheduler.run(shutdown))
}

/// Token validation needs a secret; without one, run with a throwaway
/// secret and log a development token for it
fn jwt_manager(config: &AuthConfig) -> anyhow::Result<JwtManager> {
    if let Some(ref secret) = config.jwt_secret {
        return Ok(JwtManager::new(secret, config.jwt_expiration_secs));
    }

    let secret = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
    let manager = JwtManager::new(&secret, config.jwt_expiration_secs);
    let token = manager.generate_token(Uuid::new_v4(), vec!["admin".to_string()])?;

    warn!(
        token = %token,
        "auth.jwt_secret not set; using an ephemeral secret. Development token issued"
    );

    Ok(manager)
}

/// Create the main application router
fn create_router(state: AppState, jwt: Arc<JwtManager>, request_timeout: Duration) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // API routes
    let api_routes = Router::new()
        // Health endpoints (no auth)
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        // Article endpoints
        .route("/articles", post(handlers::articles::create_article))
        .route(
            "/articles/{slug}",
            get(handlers::articles::get_article)
                .patch(handlers::articles::update_article)
                .delete(handlers::articles::delete_article),
        )
        .route("/articles/{slug}/publish", post(handlers::articles::publish_article))
        .route("/articles/{slug}/generation", get(handlers::articles::generation_status))
        // Job endpoints
        .route("/jobs/failed", get(handlers::jobs::list_failed_jobs))
        .route("/jobs/{id}", get(handlers::jobs::get_job))
        .route_layer(axum::middleware::from_fn(middleware::metrics::track_requests));

    // Compose the app
    Router::new()
        .nest("/api/v1", api_routes)
        .layer(Extension(jwt))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
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
