//! PostgreSQL job store.
//!
//! Claiming is a single transaction:
//! 1. `SELECT ... ORDER BY created_at LIMIT 1 FOR UPDATE SKIP LOCKED`
//! 2. `UPDATE ... SET status = 'processing' WHERE id = $1 AND status = <selected>
//!    RETURNING updated_at`
//! 3. `COMMIT`
//!
//! The analysis itself runs after the commit, so no row lock is held while
//! the LLM call is in flight. The returned `updated_at` is the claim token:
//! result writes match on it, so a row reclaimed after an expired lease only
//! accepts the new owner's result.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};

use super::{JobStore, QueueError};
use crate::db::queries;
use crate::db::schema::{self, SchemaState};
use crate::models::job::{AnalysisMode, Claim, ClaimedJob, JobStatus};

// syntax_error: raised by servers that do not understand SKIP LOCKED
const SYNTAX_ERROR: &str = "42601";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    SkipLocked,
    Blocking,
}

impl LockMode {
    fn clause(self) -> &'static str {
        match self {
            LockMode::SkipLocked => "FOR UPDATE SKIP LOCKED",
            LockMode::Blocking => "FOR UPDATE",
        }
    }
}

/// Job store over the shared `clinical_analyses` table.
pub struct PgJobStore {
    pool: PgPool,
    schema: RwLock<SchemaState>,
    skip_locked: AtomicBool,
    processing_lease: Option<Duration>,
    wake: Arc<Notify>,
}

impl PgJobStore {
    pub fn new(pool: PgPool, schema: SchemaState) -> Self {
        Self {
            pool,
            schema: RwLock::new(schema),
            skip_locked: AtomicBool::new(true),
            processing_lease: None,
            wake: Arc::new(Notify::new()),
        }
    }

    /// Reclaim `processing` rows untouched for longer than `lease`.
    /// `None` leaves orphaned rows alone.
    pub fn with_processing_lease(mut self, lease: Option<Duration>) -> Self {
        self.processing_lease = lease;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn schema(&self) -> SchemaState {
        self.schema.read().await.clone()
    }

    /// Run the schema guard and cache what it reports.
    pub async fn refresh_schema(&self) -> SchemaState {
        let state = schema::ensure_schema(&self.pool).await;
        *self.schema.write().await = state.clone();
        state
    }

    /// Cached schema, re-running the guard only while it is incomplete.
    pub async fn ensure_ready(&self) -> SchemaState {
        let current = self.schema().await;
        if current.is_complete() {
            current
        } else {
            self.refresh_schema().await
        }
    }

    /// Cached schema when it has every required column, otherwise the guard's
    /// fresh report. Keeps a claim loop that started against a half-migrated
    /// table from failing forever.
    async fn claimable_schema(&self) -> SchemaState {
        let current = self.schema().await;
        if current.missing_required().is_empty() {
            current
        } else {
            self.refresh_schema().await
        }
    }

    /// Wake one idle worker in this process.
    pub fn notify_new_job(&self) {
        self.wake.notify_one();
    }

    async fn claim_with(
        &self,
        schema: &SchemaState,
        lock: LockMode,
    ) -> Result<Option<ClaimedJob>, QueueError> {
        let mut tx = self.pool.begin().await?;

        let doctor_id = if schema.supports_doctor_id() {
            "doctor_id"
        } else {
            "NULL::bigint AS doctor_id"
        };
        let filter = match self.processing_lease {
            None => "WHERE status = 'pending' ORDER BY created_at ASC, id ASC",
            Some(_) => {
                r#"WHERE status = 'pending'
                      OR (status = 'processing'
                          AND updated_at < NOW() - make_interval(secs => $1::float8))
                   ORDER BY CASE WHEN status = 'pending' THEN 0 ELSE 1 END,
                            created_at ASC, id ASC"#
            }
        };
        let statement = format!(
            r#"
            SELECT id, {doctor_id}, patient_name, specialty, note, images_json, mode, status
            FROM clinical_analyses
            {filter}
            LIMIT 1
            {lock}
            "#,
            lock = lock.clause(),
        );

        let mut query = sqlx::query(&statement);
        if let Some(lease) = self.processing_lease {
            query = query.bind(lease.as_secs_f64());
        }

        let Some(row) = query.fetch_optional(&mut *tx).await? else {
            tx.commit().await?;
            return Ok(None);
        };

        let id: i64 = row.try_get("id")?;
        let selected_status: String = row.try_get("status")?;

        let claimed_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            UPDATE clinical_analyses
            SET status = 'processing', error_message = NULL, updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING updated_at
            "#,
        )
        .bind(id)
        .bind(&selected_status)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        let Some(claimed_at) = claimed_at else {
            tracing::debug!(job_id = id, "Row advanced by another claimant");
            return Ok(None);
        };

        if selected_status == JobStatus::Processing.as_ref() {
            tracing::warn!(job_id = id, "Reclaimed analysis with expired processing lease");
        }

        let mode: String = row.try_get("mode")?;
        let images: Option<Json<Vec<String>>> = row.try_get("images_json")?;

        Ok(Some(ClaimedJob {
            id,
            claimed_at,
            doctor_id: row.try_get("doctor_id")?,
            patient_name: row.try_get("patient_name")?,
            specialty: row.try_get("specialty")?,
            note: row.try_get("note")?,
            mode: AnalysisMode::parse_lenient(Some(&mode)),
            images: images.map(|j| j.0).unwrap_or_default(),
            prompt_modifier: None,
        }))
    }
}

impl JobStore for PgJobStore {
    async fn prepare(&self) {
        self.refresh_schema().await;
    }

    async fn claim_next(&self) -> Result<Option<ClaimedJob>, QueueError> {
        let schema = self.claimable_schema().await;

        let claimed = if self.skip_locked.load(Ordering::Relaxed) {
            match self.claim_with(&schema, LockMode::SkipLocked).await {
                Err(QueueError::Database(e)) if is_syntax_error(&e) => {
                    tracing::warn!(
                        error = %e,
                        "Store rejected SKIP LOCKED, falling back to blocking row locks"
                    );
                    self.skip_locked.store(false, Ordering::Relaxed);
                    self.claim_with(&schema, LockMode::Blocking).await?
                }
                other => other?,
            }
        } else {
            self.claim_with(&schema, LockMode::Blocking).await?
        };

        let Some(mut job) = claimed else {
            return Ok(None);
        };

        job.prompt_modifier = match queries::get_prompt_modifier(&self.pool, &job.specialty).await
        {
            Ok(modifier) => modifier,
            Err(e) => {
                tracing::warn!(job_id = job.id, error = %e, "Could not load specialty prompt modifier");
                None
            }
        };

        Ok(Some(job))
    }

    async fn mark_completed(
        &self,
        claim: Claim,
        analysis: &str,
        detected_conditions: &[String],
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE clinical_analyses
            SET status = 'completed',
                analysis = $3,
                detected_conditions = $4,
                error_message = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND updated_at = $2
            "#,
        )
        .bind(claim.id)
        .bind(claim.claimed_at)
        .bind(analysis)
        .bind(Json(detected_conditions))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotClaimed(claim.id));
        }
        Ok(())
    }

    async fn mark_completed_fast(
        &self,
        claim: Claim,
        analysis: &str,
        detected_conditions: &[String],
    ) -> Result<Option<i64>, QueueError> {
        let id = claim.id;
        let schema = self.schema().await;

        if !schema.supports_upgrade_chain() {
            let result = sqlx::query(
                r#"
                UPDATE clinical_analyses
                SET status = 'completed_fast',
                    analysis = $3,
                    detected_conditions = $4,
                    error_message = NULL,
                    updated_at = NOW()
                WHERE id = $1 AND status = 'processing' AND updated_at = $2
                "#,
            )
            .bind(id)
            .bind(claim.claimed_at)
            .bind(analysis)
            .bind(Json(detected_conditions))
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(QueueError::NotClaimed(id));
            }
            tracing::warn!(job_id = id, "upgrade_to_id unavailable, no full pass queued");
            return Ok(None);
        }

        let mut tx = self.pool.begin().await?;

        let locked = sqlx::query(
            r#"
            SELECT id FROM clinical_analyses
            WHERE id = $1 AND status = 'processing' AND updated_at = $2
              AND upgrade_to_id IS NULL
            FOR UPDATE
            "#,
        )
        .bind(id)
        .bind(claim.claimed_at)
        .fetch_optional(&mut *tx)
        .await?;

        if locked.is_none() {
            return Err(QueueError::NotClaimed(id));
        }

        let doctor_id = if schema.supports_doctor_id() {
            "doctor_id, "
        } else {
            ""
        };
        let statement = format!(
            r#"
            INSERT INTO clinical_analyses
                ({doctor_id}patient_name, specialty, note, images_json, mode, status, created_at)
            SELECT {doctor_id}patient_name, specialty, note, images_json, $2, $3, NOW()
            FROM clinical_analyses
            WHERE id = $1
            RETURNING id
            "#
        );
        let row = sqlx::query(&statement)
            .bind(id)
            .bind(AnalysisMode::Full.as_ref())
            .bind(JobStatus::Pending.as_ref())
            .fetch_one(&mut *tx)
            .await?;
        let upgrade_id: i64 = row.try_get("id")?;

        sqlx::query(
            r#"
            UPDATE clinical_analyses
            SET status = 'completed_fast',
                analysis = $2,
                detected_conditions = $3,
                upgrade_to_id = $4,
                error_message = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(analysis)
        .bind(Json(detected_conditions))
        .bind(upgrade_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.wake.notify_one();

        Ok(Some(upgrade_id))
    }

    async fn mark_failed(&self, claim: Claim, error_message: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE clinical_analyses
            SET status = 'failed',
                error_message = $3,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND updated_at = $2
            "#,
        )
        .bind(claim.id)
        .bind(claim.claimed_at)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotClaimed(claim.id));
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<i64, QueueError> {
        Ok(queries::pending_count(&self.pool).await?)
    }

    async fn wait_for_job(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.wake.notified()).await;
    }
}

fn is_syntax_error(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == SYNTAX_ERROR)
}
