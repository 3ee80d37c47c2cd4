use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::services::queue::JobStore;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub queue: QueueHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct QueueHealth {
    pub status: String,
    pub pending: Option<i64>,
    /// Queue columns the schema guard could not add.
    pub missing_columns: Vec<&'static str>,
    pub upgrade_chain: bool,
}

/// GET /health: database connectivity and queue readiness.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();

    let db_check = match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            tracing::warn!(error = %e, "Health check: database unreachable");
            ComponentHealth {
                status: "error".to_string(),
                latency_ms: None,
            }
        }
    };

    let schema = state.store.schema().await;
    let pending = state.store.pending_count().await.ok();
    let missing_columns = schema.missing_required();
    let queue_ok = pending.is_some() && missing_columns.is_empty();
    let queue_check = QueueHealth {
        status: if queue_ok { "ok" } else { "error" }.to_string(),
        pending,
        missing_columns,
        upgrade_chain: schema.supports_upgrade_chain(),
    };

    let all_healthy = db_check.status == "ok" && queue_ok;
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database: db_check,
            queue: queue_check,
        },
    };

    (status_code, Json(response))
}
