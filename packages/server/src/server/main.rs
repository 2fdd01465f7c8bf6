// Main entry point for the chapter release aggregator

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tracker_core::common::SyncTier;
use tracker_core::kernel::jobs::{
    JobRegistry, JobRunner, JobRunnerConfig, PostgresJobQueue,
};
use tracker_core::kernel::scheduler::{self, SchedulerConfig};
use tracker_core::kernel::{BreakerRegistry, HttpSourceClient, ServerDeps, SyncSettings};
use tracker_core::server::{build_app, AppState};
use tracker_core::{domains, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tracker_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting chapter release aggregator");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Wire dependencies
    let breakers = Arc::new(BreakerRegistry::new(
        config.breaker_failure_threshold,
        chrono::Duration::seconds(config.breaker_cooldown_secs),
    ));
    let source_client = Arc::new(HttpSourceClient::new(
        Duration::from_secs(config.source_timeout_secs),
        &config.source_user_agent,
    ));
    let job_queue = Arc::new(PostgresJobQueue::new(pool.clone()));
    let deps = Arc::new(ServerDeps::new(
        pool.clone(),
        source_client,
        breakers,
        job_queue.clone(),
        SyncSettings {
            max_chapters_per_sync: config.max_chapters_per_sync,
        },
    ));

    // Register job handlers
    let mut registry = JobRegistry::new();
    domains::chapters::jobs::register_jobs(&mut registry);
    let registry = Arc::new(registry);
    tracing::info!(job_types = ?registry.registered_types(), "job handlers registered");

    // Start the job runner
    let shutdown = CancellationToken::new();
    let runner_config = JobRunnerConfig {
        worker_id: config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4())),
        max_concurrent_jobs: config.max_concurrent_jobs,
        max_concurrent_per_type: config.max_concurrent_per_type,
        max_concurrent_per_source: config.max_concurrent_per_source,
        drain_timeout: Duration::from_secs(config.shutdown_drain_secs),
        ..JobRunnerConfig::default()
    };
    let runner = JobRunner::with_config(job_queue, registry, deps.clone(), runner_config);
    let runner_handle = tokio::spawn(runner.run(shutdown.clone()));

    // Start the sync scheduler
    let scheduler_config = SchedulerConfig {
        batch_cap: config.scheduler_batch_cap,
        tier_intervals: HashMap::from([
            (SyncTier::Hot, chrono::Duration::minutes(config.hot_interval_minutes)),
            (SyncTier::Warm, chrono::Duration::minutes(config.warm_interval_minutes)),
            (SyncTier::Cold, chrono::Duration::minutes(config.cold_interval_minutes)),
        ]),
        failure_ceiling: config.scheduler_failure_ceiling,
        cron: config.scheduler_cron.clone(),
    };
    let mut cron = scheduler::start_scheduler(scheduler_config.clone(), deps.clone())
        .await
        .context("Failed to start scheduler")?;

    // Build and serve the operational surface
    let app = build_app(AppState {
        deps,
        scheduler_config,
    });
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received shutdown signal");
            serve_shutdown.cancel();
        })
        .await
        .context("Server error")?;

    // Stop claiming new work and drain in-flight jobs.
    shutdown.cancel();
    cron.shutdown().await.ok();
    runner_handle
        .await
        .context("runner task panicked")?
        .context("runner failed")?;

    tracing::info!("shutdown complete");
    Ok(())
}
