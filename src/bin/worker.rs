use rounds_iq::{
    config::AppConfig,
    db::{self, schema},
    services::{analysis::OpenAiClient, queue::PgJobStore, worker},
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting clinical analysis worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // The server normally runs migrations; a worker started first must not
    // find the table missing.
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let schema_state = schema::ensure_schema(&db_pool).await;
    let store = Arc::new(
        PgJobStore::new(db_pool, schema_state).with_processing_lease(config.processing_lease()),
    );

    tracing::info!("Initializing LLM client");
    let engine = Arc::new(
        OpenAiClient::new(config.openai_settings()).expect("Failed to initialize LLM client"),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = worker::spawn_workers(
        config.worker_concurrency,
        store,
        engine,
        config.worker_config(),
        shutdown_rx,
    );

    tracing::info!(
        concurrency = config.worker_concurrency,
        "Worker ready, processing queued analyses"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested, finishing in-flight analyses");

    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }

    tracing::info!("Worker stopped");
}
