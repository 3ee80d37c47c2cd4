//! In-memory job store for tests and single-process development.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use super::{JobStore, QueueError};
use crate::models::job::{AnalysisMode, Claim, ClaimedJob, ClinicalAnalysis, JobStatus, NewAnalysis};

/// In-memory `clinical_analyses` table.
///
/// The whole table sits behind one mutex, so each claim is a single atomic
/// read-modify-write just like the transactional claim in PostgreSQL.
/// Cloning returns a handle to the **same** table.
#[derive(Clone)]
pub struct MemoryJobStore {
    table: Arc<Mutex<Table>>,
    notify: Arc<Notify>,
    upgrade_chain: bool,
    processing_lease: Option<Duration>,
}

#[derive(Default)]
struct Table {
    rows: Vec<ClinicalAnalysis>,
    next_id: i64,
}

impl Table {
    fn insert(&mut self, new: NewAnalysis, created_at: DateTime<Utc>) -> i64 {
        self.next_id += 1;
        let id = self.next_id;
        self.rows.push(ClinicalAnalysis {
            id,
            doctor_id: new.doctor_id,
            patient_name: new.patient_name,
            specialty: new.specialty,
            note: new.note,
            status: JobStatus::Pending,
            mode: new.mode,
            images: new.images,
            analysis: None,
            detected_conditions: Vec::new(),
            error_message: None,
            upgrade_to_id: None,
            created_at,
            updated_at: None,
        });
        id
    }

    /// The row still owned by `claim`.
    fn claimed_mut(&mut self, claim: Claim) -> Result<&mut ClinicalAnalysis, QueueError> {
        self.rows
            .iter_mut()
            .find(|r| {
                r.id == claim.id
                    && r.status == JobStatus::Processing
                    && r.updated_at == Some(claim.claimed_at)
            })
            .ok_or(QueueError::NotClaimed(claim.id))
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table::default())),
            notify: Arc::new(Notify::new()),
            upgrade_chain: true,
            processing_lease: None,
        }
    }

    /// Behave like a table without the `upgrade_to_id` column.
    #[must_use]
    pub fn without_upgrade_chain(mut self) -> Self {
        self.upgrade_chain = false;
        self
    }

    #[must_use]
    pub fn with_processing_lease(mut self, lease: Duration) -> Self {
        self.processing_lease = Some(lease);
        self
    }

    /// Insert a `pending` row created now.
    pub async fn insert(&self, new: NewAnalysis) -> i64 {
        self.insert_at(new, Utc::now()).await
    }

    /// Insert a `pending` row with an explicit `created_at`.
    pub async fn insert_at(&self, new: NewAnalysis, created_at: DateTime<Utc>) -> i64 {
        let id = self.table.lock().await.insert(new, created_at);
        self.notify.notify_one();
        id
    }

    pub async fn get(&self, id: i64) -> Option<ClinicalAnalysis> {
        self.table
            .lock()
            .await
            .rows
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub async fn rows(&self) -> Vec<ClinicalAnalysis> {
        self.table.lock().await.rows.clone()
    }

    #[must_use = "this returns the count, it doesn't modify the table"]
    pub async fn len(&self) -> usize {
        self.table.lock().await.rows.len()
    }

    /// Force a row's `updated_at`, e.g. to simulate a crashed worker.
    pub async fn set_updated_at(&self, id: i64, updated_at: DateTime<Utc>) {
        if let Some(row) = self.table.lock().await.rows.iter_mut().find(|r| r.id == id) {
            row.updated_at = Some(updated_at);
        }
    }

    fn lease_expired(&self, row: &ClinicalAnalysis, now: DateTime<Utc>) -> bool {
        let (Some(lease), Some(updated_at)) = (self.processing_lease, row.updated_at) else {
            return false;
        };
        now.signed_duration_since(updated_at)
            .to_std()
            .is_ok_and(|age| age > lease)
    }
}

impl JobStore for MemoryJobStore {
    async fn claim_next(&self) -> Result<Option<ClaimedJob>, QueueError> {
        let now = Utc::now();
        let mut table = self.table.lock().await;

        let oldest_pending = table
            .rows
            .iter()
            .filter(|r| r.status == JobStatus::Pending)
            .min_by_key(|r| (r.created_at, r.id))
            .map(|r| r.id);
        let candidate = oldest_pending.or_else(|| {
            table
                .rows
                .iter()
                .filter(|r| r.status == JobStatus::Processing && self.lease_expired(r, now))
                .min_by_key(|r| (r.created_at, r.id))
                .map(|r| r.id)
        });

        let Some(id) = candidate else {
            return Ok(None);
        };
        let Some(row) = table.rows.iter_mut().find(|r| r.id == id) else {
            return Ok(None);
        };

        row.status = JobStatus::Processing;
        row.error_message = None;
        row.updated_at = Some(now);

        Ok(Some(ClaimedJob {
            id: row.id,
            claimed_at: now,
            doctor_id: row.doctor_id,
            patient_name: row.patient_name.clone(),
            specialty: row.specialty.clone(),
            note: row.note.clone(),
            mode: row.mode,
            images: row.images.clone(),
            prompt_modifier: None,
        }))
    }

    async fn mark_completed(
        &self,
        claim: Claim,
        analysis: &str,
        detected_conditions: &[String],
    ) -> Result<(), QueueError> {
        let mut table = self.table.lock().await;
        let row = table.claimed_mut(claim)?;
        row.status = JobStatus::Completed;
        row.analysis = Some(analysis.to_string());
        row.detected_conditions = detected_conditions.to_vec();
        row.error_message = None;
        row.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_completed_fast(
        &self,
        claim: Claim,
        analysis: &str,
        detected_conditions: &[String],
    ) -> Result<Option<i64>, QueueError> {
        let now = Utc::now();
        let mut table = self.table.lock().await;

        let row = table.claimed_mut(claim)?;
        if row.upgrade_to_id.is_some() {
            return Err(QueueError::NotClaimed(claim.id));
        }
        let follow_up = NewAnalysis {
            doctor_id: row.doctor_id,
            patient_name: row.patient_name.clone(),
            specialty: row.specialty.clone(),
            note: row.note.clone(),
            mode: AnalysisMode::Full,
            images: row.images.clone(),
        };

        let upgrade_id = self
            .upgrade_chain
            .then(|| table.insert(follow_up, now));

        let row = table.claimed_mut(claim)?;
        row.status = JobStatus::CompletedFast;
        row.analysis = Some(analysis.to_string());
        row.detected_conditions = detected_conditions.to_vec();
        row.upgrade_to_id = upgrade_id;
        row.error_message = None;
        row.updated_at = Some(now);
        drop(table);

        if upgrade_id.is_some() {
            self.notify.notify_one();
        }
        Ok(upgrade_id)
    }

    async fn mark_failed(&self, claim: Claim, error_message: &str) -> Result<(), QueueError> {
        let mut table = self.table.lock().await;
        let row = table.claimed_mut(claim)?;
        row.status = JobStatus::Failed;
        row.error_message = Some(error_message.to_string());
        row.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn pending_count(&self) -> Result<i64, QueueError> {
        let table = self.table.lock().await;
        Ok(table
            .rows
            .iter()
            .filter(|r| r.status == JobStatus::Pending)
            .count() as i64)
    }

    async fn wait_for_job(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}
