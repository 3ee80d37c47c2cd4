use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Status of a clinical analysis row in the shared queue table.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    CompletedFast,
    Failed,
}

impl JobStatus {
    /// Terminal states are never claimed again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedFast | JobStatus::Failed
        )
    }
}

/// Service tier requested at intake.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum AnalysisMode {
    /// Short JSON triage, followed by an automatically queued full pass.
    Fast,
    #[default]
    Full,
}

impl AnalysisMode {
    /// Lenient parse used by the intake API: anything unrecognised is `Full`.
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        raw.map(str::trim)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

/// A row of `clinical_analyses`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClinicalAnalysis {
    pub id: i64,
    pub doctor_id: Option<i64>,
    pub patient_name: String,
    pub specialty: String,
    pub note: String,
    pub status: JobStatus,
    pub mode: AnalysisMode,
    pub images: Vec<String>,
    pub analysis: Option<String>,
    pub detected_conditions: Vec<String>,
    pub error_message: Option<String>,
    pub upgrade_to_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Input for a new `pending` row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAnalysis {
    pub doctor_id: Option<i64>,
    pub patient_name: String,
    pub specialty: String,
    pub note: String,
    pub mode: AnalysisMode,
    pub images: Vec<String>,
}

impl NewAnalysis {
    pub fn new(note: impl Into<String>, specialty: impl Into<String>, mode: AnalysisMode) -> Self {
        let note = note.into();
        Self {
            doctor_id: None,
            patient_name: patient_name_from_note(&note),
            specialty: specialty.into(),
            note,
            mode,
            images: Vec::new(),
        }
    }
}

/// Patient name is the text before the first comma of the note.
pub fn patient_name_from_note(note: &str) -> String {
    match note.split_once(',') {
        Some((head, _)) => head.trim().to_string(),
        None => "Unknown".to_string(),
    }
}

/// Ownership of a `processing` row: its id and the `updated_at` stamped by
/// the claim. Result writes only apply while the row still carries that
/// stamp, so a worker whose lease expired cannot overwrite the reclaimer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub id: i64,
    pub claimed_at: DateTime<Utc>,
}

/// A row claimed by a worker, carrying everything the analysis needs.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: i64,
    pub claimed_at: DateTime<Utc>,
    pub doctor_id: Option<i64>,
    pub patient_name: String,
    pub specialty: String,
    pub note: String,
    pub mode: AnalysisMode,
    pub images: Vec<String>,
    /// Specialty-specific prompt text, looked up after the claim commits.
    pub prompt_modifier: Option<String>,
}

impl ClaimedJob {
    pub fn claim(&self) -> Claim {
        Claim {
            id: self.id,
            claimed_at: self.claimed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_as_snake_case() {
        assert_eq!(JobStatus::CompletedFast.to_string(), "completed_fast");
        assert_eq!(
            "completed_fast".parse::<JobStatus>().unwrap(),
            JobStatus::CompletedFast
        );
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::CompletedFast.is_terminal());
    }

    #[test]
    fn test_mode_parse_is_lenient() {
        assert_eq!(AnalysisMode::parse_lenient(Some("FAST")), AnalysisMode::Fast);
        assert_eq!(AnalysisMode::parse_lenient(Some(" fast ")), AnalysisMode::Fast);
        assert_eq!(AnalysisMode::parse_lenient(Some("turbo")), AnalysisMode::Full);
        assert_eq!(AnalysisMode::parse_lenient(None), AnalysisMode::Full);
    }

    #[test]
    fn test_patient_name_from_note() {
        assert_eq!(
            patient_name_from_note("Jane Doe, 64F, fever and hypotension"),
            "Jane Doe"
        );
        assert_eq!(patient_name_from_note("no comma here"), "Unknown");
    }

    #[test]
    fn test_new_analysis_derives_patient() {
        let new = NewAnalysis::new("John Roe, chest pain", "cardiology", AnalysisMode::Fast);
        assert_eq!(new.patient_name, "John Roe");
        assert_eq!(new.mode, AnalysisMode::Fast);
        assert!(new.images.is_empty());
    }
}
