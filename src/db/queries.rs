use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Row};

use crate::db::schema::SchemaState;
use crate::models::analysis::{ComparisonRecord, HistoryEntry, WorkerStats};
use crate::models::job::{AnalysisMode, ClinicalAnalysis, JobStatus, NewAnalysis};

/// Select list for a full row; optional columns read as NULL when absent.
pub fn analysis_columns(schema: &SchemaState) -> String {
    let doctor_id = if schema.supports_doctor_id() {
        "doctor_id"
    } else {
        "NULL::bigint AS doctor_id"
    };
    let upgrade_to_id = if schema.supports_upgrade_chain() {
        "upgrade_to_id"
    } else {
        "NULL::bigint AS upgrade_to_id"
    };
    format!(
        "id, {doctor_id}, patient_name, specialty, note, status, mode, images_json, analysis, \
         detected_conditions, error_message, {upgrade_to_id}, created_at, updated_at"
    )
}

/// Map a row selected with [`analysis_columns`].
pub fn analysis_from_row(row: &PgRow) -> Result<ClinicalAnalysis, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let mode: String = row.try_get("mode")?;
    let images: Option<Json<Vec<String>>> = row.try_get("images_json")?;
    let detected: Option<Json<Vec<String>>> = row.try_get("detected_conditions")?;

    Ok(ClinicalAnalysis {
        id: row.try_get("id")?,
        doctor_id: row.try_get("doctor_id")?,
        patient_name: row.try_get("patient_name")?,
        specialty: row.try_get("specialty")?,
        note: row.try_get("note")?,
        status: parse_status(&status)?,
        mode: AnalysisMode::parse_lenient(Some(&mode)),
        images: images.map(|j| j.0).unwrap_or_default(),
        analysis: row.try_get("analysis")?,
        detected_conditions: detected.map(|j| j.0).unwrap_or_default(),
        error_message: row.try_get("error_message")?,
        upgrade_to_id: row.try_get("upgrade_to_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub fn parse_status(raw: &str) -> Result<JobStatus, sqlx::Error> {
    raw.parse::<JobStatus>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

/// Insert a new `pending` row and return its id.
pub async fn create_analysis(
    pool: &PgPool,
    schema: &SchemaState,
    new: &NewAnalysis,
) -> Result<i64, sqlx::Error> {
    insert_row(pool, schema, new, JobStatus::Pending, None, &[]).await
}

/// Insert an already finished row (synchronous `/analyze`).
pub async fn insert_completed(
    pool: &PgPool,
    schema: &SchemaState,
    new: &NewAnalysis,
    analysis: &str,
    detected_conditions: &[String],
) -> Result<i64, sqlx::Error> {
    insert_row(
        pool,
        schema,
        new,
        JobStatus::Completed,
        Some(analysis),
        detected_conditions,
    )
    .await
}

async fn insert_row<'e>(
    executor: impl PgExecutor<'e>,
    schema: &SchemaState,
    new: &NewAnalysis,
    status: JobStatus,
    analysis: Option<&str>,
    detected_conditions: &[String],
) -> Result<i64, sqlx::Error> {
    let (doctor_column, doctor_value) = if schema.supports_doctor_id() {
        ("doctor_id, ", "$9, ")
    } else {
        ("", "")
    };
    let statement = format!(
        r#"
        INSERT INTO clinical_analyses
            ({doctor_column}patient_name, specialty, note, status, mode, images_json,
             analysis, detected_conditions, created_at)
        VALUES ({doctor_value}$1, $2, $3, $4, $5, $6, $7, $8, NOW())
        RETURNING id
        "#
    );

    let mut query = sqlx::query(&statement)
        .bind(&new.patient_name)
        .bind(&new.specialty)
        .bind(&new.note)
        .bind(status.as_ref())
        .bind(new.mode.as_ref())
        .bind(Json(&new.images))
        .bind(analysis)
        .bind(Json(detected_conditions));
    if schema.supports_doctor_id() {
        query = query.bind(new.doctor_id);
    }

    let row = query.fetch_one(executor).await?;
    row.try_get("id")
}

/// Get a row by id
pub async fn get_analysis(
    pool: &PgPool,
    schema: &SchemaState,
    id: i64,
) -> Result<Option<ClinicalAnalysis>, sqlx::Error> {
    let statement = format!(
        "SELECT {} FROM clinical_analyses WHERE id = $1",
        analysis_columns(schema)
    );
    let row = sqlx::query(&statement)
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(analysis_from_row).transpose()
}

/// All analyses for one patient, newest first.
pub async fn patient_history(
    pool: &PgPool,
    patient_name: &str,
) -> Result<Vec<HistoryEntry>, sqlx::Error> {
    sqlx::query_as::<_, HistoryEntry>(
        r#"
        SELECT id, patient_name, specialty, status, created_at
        FROM clinical_analyses
        WHERE patient_name = $1
        ORDER BY created_at DESC
        "#,
    )
    .bind(patient_name)
    .fetch_all(pool)
    .await
}

/// Row counts for the states an operator cares about.
pub async fn worker_stats(pool: &PgPool) -> Result<WorkerStats, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) FILTER (WHERE status = 'pending') AS pending,
               COUNT(*) FILTER (WHERE status = 'processing') AS processing,
               COUNT(*) FILTER (WHERE status = 'failed') AS failed
        FROM clinical_analyses
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(WorkerStats {
        pending: row.try_get("pending")?,
        processing: row.try_get("processing")?,
        failed: row.try_get("failed")?,
    })
}

pub async fn pending_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    let row = sqlx::query("SELECT COUNT(*) AS c FROM clinical_analyses WHERE status = 'pending'")
        .fetch_one(pool)
        .await?;
    row.try_get("c")
}

pub async fn comparison_record(
    pool: &PgPool,
    id: i64,
) -> Result<Option<ComparisonRecord>, sqlx::Error> {
    sqlx::query_as::<_, ComparisonRecord>(
        r#"
        SELECT id, patient_name, specialty, note, analysis, created_at
        FROM clinical_analyses
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Specialty-specific prompt text; empty modifiers read as `None`.
pub async fn get_prompt_modifier(
    pool: &PgPool,
    specialty_slug: &str,
) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query("SELECT prompt_modifier FROM specialties WHERE slug = $1")
        .bind(specialty_slug)
        .fetch_optional(pool)
        .await?;

    let modifier: Option<String> = match row {
        Some(r) => r.try_get("prompt_modifier")?,
        None => None,
    };
    Ok(modifier.filter(|m| !m.trim().is_empty()))
}
