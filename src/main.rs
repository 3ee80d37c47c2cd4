use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use rounds_iq::{
    app_state::AppState,
    config::AppConfig,
    db::{self, schema},
    routes::{self, metrics::MetricsState},
    services::{analysis::OpenAiClient, queue::PgJobStore, worker},
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing RoundsIQ analysis server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_histogram!(
        "analysis_processing_seconds",
        "Time spent analysing one clinical note"
    );
    metrics::describe_counter!(
        "analysis_jobs_submitted",
        "Total analyses queued through the API"
    );
    metrics::describe_counter!(
        "analysis_jobs_completed",
        "Total queued analyses completed"
    );
    metrics::describe_counter!(
        "analysis_jobs_failed",
        "Total queued analyses that failed"
    );
    metrics::describe_gauge!(
        "analysis_queue_depth",
        "Current number of pending analyses"
    );
    metrics::describe_gauge!(
        "analysis_worker_heartbeat_seconds",
        "Unix time of the last worker heartbeat"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Queue columns and index
    let schema_state = schema::ensure_schema(&db_pool).await;
    let store = Arc::new(
        PgJobStore::new(db_pool, schema_state).with_processing_lease(config.processing_lease()),
    );

    tracing::info!("Initializing LLM client");
    let engine = Arc::new(
        OpenAiClient::new(config.openai_settings()).expect("Failed to initialize LLM client"),
    );

    // Embedded claim loops
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = if config.embedded_worker {
        tracing::info!(
            concurrency = config.worker_concurrency,
            "Starting embedded analysis workers"
        );
        worker::spawn_workers(
            config.worker_concurrency,
            Arc::clone(&store),
            Arc::clone(&engine),
            config.worker_config(),
            shutdown_rx,
        )
    } else {
        tracing::info!("Embedded worker disabled; run the worker binary separately");
        Vec::new()
    };

    let metrics_state = MetricsState {
        handle: prometheus_handle,
        store: Arc::clone(&store),
    };
    let state = AppState::new(store, engine, config.max_analyze_images);

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/queue_analysis", post(routes::analysis::queue_analysis))
        .route("/get_analysis", get(routes::analysis::get_analysis))
        .route("/analyze", post(routes::analysis::analyze))
        .route("/history", get(routes::analysis::history))
        .route("/worker_stats", get(routes::analysis::worker_stats))
        .route("/compare", get(routes::analysis::compare))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(metrics_state),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(25 * 1024 * 1024)); // 25 MB limit

    tracing::info!("Starting RoundsIQ on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // In-flight analyses finish before the process exits.
    let _ = shutdown_tx.send(true);
    for handle in workers {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }
    tracing::info!("Server stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
