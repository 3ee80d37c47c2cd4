use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::models::job::{patient_name_from_note, AnalysisMode, ClinicalAnalysis, JobStatus, NewAnalysis};

/// JSON body accepted by the intake endpoints when no files are uploaded.
#[derive(Debug, Default, Deserialize)]
pub struct AnalysisRequestBody {
    pub note: Option<String>,
    pub specialty: Option<String>,
    pub doctor_id: Option<serde_json::Value>,
    pub mode: Option<String>,
}

/// Normalised intake submission, from either multipart or JSON.
#[derive(Debug, Clone, Validate)]
pub struct Submission {
    #[garde(length(min = 1, max = 100_000))]
    pub note: String,

    #[garde(length(min = 1, max = 100))]
    pub specialty: String,

    #[garde(skip)]
    pub doctor_id: Option<i64>,

    #[garde(skip)]
    pub mode: AnalysisMode,

    /// PNG data URIs, in upload order.
    #[garde(skip)]
    pub images: Vec<String>,

    /// Human-readable description of each upload, including skipped ones.
    #[garde(skip)]
    pub image_notes: Vec<String>,
}

impl Submission {
    /// Row to insert for this submission.
    pub fn new_analysis(&self) -> NewAnalysis {
        NewAnalysis {
            doctor_id: self.doctor_id,
            patient_name: patient_name_from_note(&self.note),
            specialty: self.specialty.clone(),
            note: self.note.clone(),
            mode: self.mode,
            images: self.images.clone(),
        }
    }
}

/// Response after queueing an analysis.
#[derive(Debug, Serialize)]
pub struct QueueResponse {
    pub analysis_id: i64,
    pub status: JobStatus,
}

/// Response of the synchronous `/analyze` endpoint.
#[derive(Debug, Serialize)]
pub struct SyncAnalysisResponse {
    pub full_response: String,
    pub summary: String,
    pub detected_conditions: Vec<String>,
}

/// Status API view of a row.
#[derive(Debug, Serialize)]
pub struct AnalysisStatusResponse {
    pub id: i64,
    pub patient_name: String,
    pub specialty: String,
    pub note: String,
    pub analysis: Option<String>,
    pub status: JobStatus,
    pub mode: AnalysisMode,
    pub images_json: Vec<String>,
    pub detected_conditions: Vec<String>,
    pub error_message: Option<String>,
    pub upgrade_to_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<ClinicalAnalysis> for AnalysisStatusResponse {
    fn from(row: ClinicalAnalysis) -> Self {
        Self {
            id: row.id,
            patient_name: row.patient_name,
            specialty: row.specialty,
            note: row.note,
            analysis: row.analysis,
            status: row.status,
            mode: row.mode,
            images_json: row.images,
            detected_conditions: row.detected_conditions,
            error_message: row.error_message,
            upgrade_to_id: row.upgrade_to_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// One line of a patient's history.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct HistoryEntry {
    pub id: i64,
    pub patient_name: String,
    pub specialty: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Queue depth by state.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct WorkerStats {
    pub pending: i64,
    pub processing: i64,
    pub failed: i64,
}

/// Record shown side by side by `/compare`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ComparisonRecord {
    pub id: i64,
    pub patient_name: String,
    pub specialty: String,
    pub note: String,
    pub analysis: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ComparisonResponse {
    pub comparison: [ComparisonRecord; 2],
}
