use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::services::queue::{JobStore, PgJobStore};

#[derive(Clone)]
pub struct MetricsState {
    pub handle: Arc<PrometheusHandle>,
    pub store: Arc<PgJobStore>,
}

/// Prometheus scrape endpoint.
/// Queue depth is refreshed on every scrape so it is current even when no
/// embedded worker is heartbeating in this process.
pub async fn prometheus_metrics(State(scrape): State<MetricsState>) -> impl IntoResponse {
    match scrape.store.pending_count().await {
        Ok(depth) => metrics::gauge!("analysis_queue_depth").set(depth as f64),
        Err(e) => tracing::warn!(error = %e, "Could not read queue depth for scrape"),
    }
    scrape.handle.render()
}
