use axum::body::Bytes;
use axum::extract::{FromRequest, Multipart, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use garde::Validate;
use serde::Deserialize;
use std::time::Instant;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::analysis::{
    AnalysisRequestBody, AnalysisStatusResponse, ComparisonResponse, HistoryEntry, QueueResponse,
    Submission, SyncAnalysisResponse, WorkerStats,
};
use crate::models::job::{AnalysisMode, JobStatus};
use crate::services::analysis::{AnalysisEngine, AnalysisError, AnalysisRequest};
use crate::services::images::{self, ImageError};

/// Error returned by the HTTP handlers, rendered as `{"error": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Invalid submission: {0}")]
    Validation(#[from] garde::Report),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Analysis failed: {0}")]
    Analysis(#[from] AnalysisError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Analysis(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Form fields collected before normalisation.
#[derive(Debug, Default)]
struct RawSubmission {
    note: Option<String>,
    specialty: Option<String>,
    doctor_id: Option<String>,
    mode: Option<String>,
    images: Vec<String>,
    image_notes: Vec<String>,
}

impl From<AnalysisRequestBody> for RawSubmission {
    fn from(body: AnalysisRequestBody) -> Self {
        let doctor_id = body.doctor_id.and_then(|v| match v {
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::String(s) => Some(s),
            _ => None,
        });
        Self {
            note: body.note,
            specialty: body.specialty,
            doctor_id,
            mode: body.mode,
            ..Default::default()
        }
    }
}

impl RawSubmission {
    fn finish(self) -> Result<Submission, ApiError> {
        let note = self.note.as_deref().map(str::trim).unwrap_or_default();
        if note.is_empty() {
            return Err(ApiError::BadRequest("Missing clinical note".to_string()));
        }

        let specialty = self
            .specialty
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("general");

        let submission = Submission {
            note: note.to_string(),
            specialty: specialty.to_string(),
            doctor_id: self.doctor_id.and_then(|raw| raw.trim().parse().ok()),
            mode: AnalysisMode::parse_lenient(self.mode.as_deref()),
            images: self.images,
            image_notes: self.image_notes,
        };
        submission.validate()?;
        Ok(submission)
    }
}

/// Read a submission from a multipart form or a JSON body.
///
/// A JSON body that does not parse is treated as empty, so it fails on the
/// missing note rather than on syntax.
async fn read_submission(request: Request, max_images: usize) -> Result<Submission, ApiError> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    let raw = if is_multipart {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        read_multipart(multipart, max_images).await?
    } else {
        let body = Bytes::from_request(request, &())
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        serde_json::from_slice::<AnalysisRequestBody>(&body)
            .unwrap_or_default()
            .into()
    };

    raw.finish()
}

async fn read_multipart(
    mut multipart: Multipart,
    max_images: usize,
) -> Result<RawSubmission, ApiError> {
    let mut raw = RawSubmission::default();
    let mut uploads = 0usize;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "images" | "images[]" => {
                let index = uploads;
                uploads += 1;
                if index >= max_images {
                    continue;
                }

                let filename = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.body_text()))?;

                let name_for_decode = filename.clone();
                let converted = tokio::task::spawn_blocking(move || {
                    images::upload_to_data_uri(&name_for_decode, &bytes)
                })
                .await;

                match converted {
                    Ok(Ok(uri)) => {
                        raw.images.push(uri);
                        raw.image_notes.push(format!("{filename} (image)"));
                    }
                    Ok(Err(ImageError::UnsupportedExtension(_))) => {
                        tracing::debug!(filename = %filename, "Skipping upload with unsupported extension");
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(filename = %filename, error = %e, "Skipping undecodable upload");
                        raw.image_notes.push(format!("{filename} (error: {e})"));
                    }
                    Err(e) => {
                        tracing::warn!(filename = %filename, error = %e, "Image conversion task failed");
                        raw.image_notes.push(format!("{filename} (error: {e})"));
                    }
                }
            }
            "note" | "specialty" | "doctor_id" | "mode" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.body_text()))?;
                match name.as_str() {
                    "note" => raw.note = Some(value),
                    "specialty" => raw.specialty = Some(value),
                    "doctor_id" => raw.doctor_id = Some(value),
                    _ => raw.mode = Some(value),
                }
            }
            _ => {}
        }
    }

    Ok(raw)
}

/// POST /queue_analysis: store a `pending` row for the background workers.
pub async fn queue_analysis(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<QueueResponse>, ApiError> {
    let submission = read_submission(request, state.max_images).await?;
    let schema = state.store.ensure_ready().await;
    let new = submission.new_analysis();

    let analysis_id = queries::create_analysis(&state.db, &schema, &new).await?;
    state.store.notify_new_job();

    metrics::counter!("analysis_jobs_submitted", "mode" => new.mode.to_string()).increment(1);
    tracing::info!(
        analysis_id,
        mode = %new.mode,
        images = new.images.len(),
        specialty = %new.specialty,
        "Analysis queued"
    );

    Ok(Json(QueueResponse {
        analysis_id,
        status: JobStatus::Pending,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AnalysisIdQuery {
    pub id: Option<String>,
}

/// GET /get_analysis?id=: current state of one row.
pub async fn get_analysis(
    State(state): State<AppState>,
    Query(query): Query<AnalysisIdQuery>,
) -> Result<Json<AnalysisStatusResponse>, ApiError> {
    let raw = query
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing analysis ID".to_string()))?;
    let id = parse_id(&raw)?;

    let schema = state.store.ensure_ready().await;
    let record = queries::get_analysis(&state.db, &schema, id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Analysis not found".to_string()))?;

    Ok(Json(record.into()))
}

/// POST /analyze: synchronous full analysis, stored as `completed`.
pub async fn analyze(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<SyncAnalysisResponse>, ApiError> {
    let mut submission = read_submission(request, state.max_images).await?;
    submission.mode = AnalysisMode::Full;

    let prompt_modifier = match queries::get_prompt_modifier(&state.db, &submission.specialty).await
    {
        Ok(modifier) => modifier,
        Err(e) => {
            tracing::warn!(specialty = %submission.specialty, error = %e, "Prompt modifier lookup failed");
            None
        }
    };

    let started = Instant::now();
    let report = state
        .engine
        .analyze(AnalysisRequest {
            note: &submission.note,
            specialty: &submission.specialty,
            images: &submission.images,
            image_notes: &submission.image_notes,
            mode: AnalysisMode::Full,
            prompt_modifier: prompt_modifier.as_deref(),
        })
        .await?;
    metrics::histogram!("analysis_processing_seconds", "mode" => AnalysisMode::Full.to_string())
        .record(started.elapsed().as_secs_f64());

    let schema = state.store.ensure_ready().await;
    let id = queries::insert_completed(
        &state.db,
        &schema,
        &submission.new_analysis(),
        &report.text,
        &report.detected_conditions,
    )
    .await?;

    tracing::info!(
        analysis_id = id,
        conditions = ?report.detected_conditions,
        "Synchronous analysis stored"
    );

    Ok(Json(SyncAnalysisResponse {
        summary: format!("Processed {} image(s).", submission.images.len()),
        full_response: report.text,
        detected_conditions: report.detected_conditions,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub patient_name: Option<String>,
}

/// GET /history?patient_name=: a patient's analyses, newest first.
pub async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let patient_name = query
        .patient_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing patient_name".to_string()))?;

    Ok(Json(queries::patient_history(&state.db, patient_name).await?))
}

/// GET /worker_stats
pub async fn worker_stats(State(state): State<AppState>) -> Result<Json<WorkerStats>, ApiError> {
    Ok(Json(queries::worker_stats(&state.db).await?))
}

#[derive(Debug, Deserialize)]
pub struct CompareQuery {
    pub id1: Option<String>,
    pub id2: Option<String>,
}

/// GET /compare?id1=&id2=: two records side by side.
pub async fn compare(
    State(state): State<AppState>,
    Query(query): Query<CompareQuery>,
) -> Result<Json<ComparisonResponse>, ApiError> {
    let (Some(raw1), Some(raw2)) = (query.id1, query.id2) else {
        return Err(ApiError::BadRequest("Missing id1 or id2".to_string()));
    };
    let (id1, id2) = (parse_id(&raw1)?, parse_id(&raw2)?);

    let first = queries::comparison_record(&state.db, id1).await?;
    let second = queries::comparison_record(&state.db, id2).await?;
    match (first, second) {
        (Some(a), Some(b)) => Ok(Json(ComparisonResponse { comparison: [a, b] })),
        _ => Err(ApiError::NotFound(
            "One or both records not found".to_string(),
        )),
    }
}

fn parse_id(raw: &str) -> Result<i64, ApiError> {
    raw.trim()
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid analysis ID: {raw}")))
}
