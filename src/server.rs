//! Server setup and initialization
//!
//! Wires together storage, the definition registry, the enrollment engine,
//! the background scheduler and the HTTP routes.

use crate::{
    api::{create_api_routes, AppState},
    config::{Config, SchedulerConfig},
    integrations::Integrations,
    runtime::{EnrollmentEngine, SchedulerService, StatsAggregator, StepScheduler, TriggerEvaluator},
    sequence::{SequenceRegistry, SequenceStorage},
    store::Database,
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Runtime components: handler state plus the step scheduler that drives sweeps
pub struct Runtime {
    pub state: AppState,
    pub steps: Arc<StepScheduler>,
}

/// Build every runtime component on top of an open database
///
/// Loads the registry from storage before returning, so the state is ready
/// to serve requests. Used by `create_app` and by integration tests.
pub async fn build_runtime(
    database: &Database,
    integrations: Integrations,
    scheduler: &SchedulerConfig,
) -> Result<Runtime> {
    tracing::info!("📊 Initializing sequence registry");
    let registry = Arc::new(SequenceRegistry::new(SequenceStorage::new(database.pool().clone())));
    registry
        .refresh()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load sequences from storage: {}", e))?;

    tracing::info!("🚀 Initializing enrollment engine");
    let directory = Arc::clone(&integrations.directory);
    let engine = Arc::new(EnrollmentEngine::new(
        database,
        Arc::clone(&registry),
        integrations,
        scheduler.default_retry_limit,
    ));

    let triggers = Arc::new(TriggerEvaluator::new(Arc::clone(&engine), directory));
    let stats = Arc::new(StatsAggregator::new(
        engine.sequences().clone(),
        engine.enrollments().clone(),
    ));
    let steps = Arc::new(StepScheduler::new(
        Arc::clone(&engine),
        scheduler.batch_size,
        scheduler.lease_secs,
    ));

    Ok(Runtime {
        state: AppState { engine, triggers, stats },
        steps,
    })
}

/// Create the main Axum application with all routes
///
/// Opens the database, builds integrations from configuration, starts the
/// background scheduler and returns the router.
pub async fn create_app(config: Config) -> Result<Router> {
    tracing::info!("📁 Ensuring data directory exists: {}", config.database.data_dir);
    let database = Database::open(&config.database.data_dir).await?;

    tracing::info!("🔌 Initializing integrations");
    let integrations = Integrations::from_config(&config.integrations);

    let Runtime { state, steps } = build_runtime(&database, integrations, &config.scheduler).await?;

    tracing::info!("⏰ Initializing scheduler service");
    let service = Arc::new(
        SchedulerService::new(
            steps,
            Arc::clone(&state.triggers),
            Arc::clone(&state.stats),
            Arc::clone(state.engine.registry()),
            config.scheduler.clone(),
        )
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize scheduler: {}", e))?,
    );

    tracing::info!("🚀 Starting scheduler service");
    let service_clone = Arc::clone(&service);
    tokio::spawn(async move {
        if let Err(e) = service_clone.start().await {
            tracing::error!("❌ Failed to start scheduler service: {}", e);
        }
    });

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let app = create_router(state);

    tracing::info!("✅ Application initialized successfully");
    Ok(app)
}

/// Health check plus the API routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .merge(create_api_routes(state))
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting Dripway server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}
