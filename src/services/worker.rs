//! Background claim loop.
//!
//! Each iteration claims at most one row, runs the analysis outside any
//! transaction and hands the outcome to the store. Several workers (in one
//! process or many) can run side by side; the claim transaction is the only
//! coordination between them.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::models::job::{AnalysisMode, Claim, ClaimedJob};
use crate::services::analysis::{AnalysisEngine, AnalysisReport, AnalysisRequest};
use crate::services::prompts;
use crate::services::queue::{JobStore, QueueError};

/// Timing knobs of the claim loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Idle wait when the queue is empty.
    pub poll_interval: Duration,
    /// Sleep after a store/claim error.
    pub error_backoff: Duration,
    /// How often a liveness line and gauges are emitted.
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            error_backoff: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed {
        id: i64,
    },
    CompletedFast {
        id: i64,
        upgrade_to_id: Option<i64>,
    },
    Failed {
        id: i64,
        error: String,
    },
    /// Neither the result nor the failure could be written; the row may be
    /// left in `processing`.
    Unrecorded {
        id: i64,
        error: String,
    },
}

/// One claim loop over a [`JobStore`], running claimed jobs through an
/// [`AnalysisEngine`] and writing the outcome back.
pub struct Worker<S, E> {
    id: usize,
    store: S,
    engine: Arc<E>,
    config: WorkerConfig,
}

impl<S: JobStore, E: AnalysisEngine> Worker<S, E> {
    pub fn new(id: usize, store: S, engine: Arc<E>, config: WorkerConfig) -> Self {
        Self {
            id,
            store,
            engine,
            config,
        }
    }

    /// Loop until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Shutdown is only observed between jobs; a claimed job always runs to
    /// completion or failure.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        self.store.prepare().await;
        tracing::info!(worker_id = self.id, "Worker ready, starting claim loop");

        let mut last_heartbeat: Option<Instant> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if last_heartbeat.map_or(true, |t| t.elapsed() >= self.config.heartbeat_interval) {
                self.heartbeat().await;
                last_heartbeat = Some(Instant::now());
            }

            match self.run_once().await {
                Ok(Some(outcome)) => {
                    tracing::debug!(worker_id = self.id, ?outcome, "Job finished, checking for next job");
                }
                Ok(None) => {
                    tracing::trace!(worker_id = self.id, "No jobs available, waiting");
                    tokio::select! {
                        _ = self.store.wait_for_job(self.config.poll_interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(worker_id = self.id, error = %e, "Claim loop error, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        tracing::info!(worker_id = self.id, "Worker stopped");
    }

    /// Claim and fully process at most one job.
    ///
    /// `Ok(None)` means the queue was empty. Errors come only from the claim;
    /// processing failures are recorded on the row and reported as an outcome.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, QueueError> {
        let Some(job) = self.store.claim_next().await? else {
            return Ok(None);
        };
        Ok(Some(self.process(job).await))
    }

    async fn process(&self, job: ClaimedJob) -> JobOutcome {
        let started = Instant::now();
        tracing::info!(
            worker_id = self.id,
            job_id = job.id,
            mode = %job.mode,
            images = job.images.len(),
            "Processing analysis"
        );

        let image_notes = prompts::queued_image_notes(job.images.len());
        let request = AnalysisRequest {
            note: &job.note,
            specialty: &job.specialty,
            images: &job.images,
            image_notes: &image_notes,
            mode: job.mode,
            prompt_modifier: job.prompt_modifier.as_deref(),
        };

        let outcome = match self.engine.analyze(request).await {
            Ok(report) => self.record_success(&job, report).await,
            Err(e) => {
                tracing::error!(job_id = job.id, error = %e, "Analysis failed");
                self.record_failure(job.claim(), job.mode, &e.to_string()).await
            }
        };

        metrics::histogram!("analysis_processing_seconds", "mode" => job.mode.to_string())
            .record(started.elapsed().as_secs_f64());

        outcome
    }

    async fn record_success(&self, job: &ClaimedJob, report: AnalysisReport) -> JobOutcome {
        let id = job.id;
        let written = match job.mode {
            AnalysisMode::Full => self
                .store
                .mark_completed(job.claim(), &report.text, &report.detected_conditions)
                .await
                .map(|()| JobOutcome::Completed { id }),
            AnalysisMode::Fast => self
                .store
                .mark_completed_fast(job.claim(), &report.text, &report.detected_conditions)
                .await
                .map(|upgrade_to_id| JobOutcome::CompletedFast { id, upgrade_to_id }),
        };

        match written {
            Ok(outcome) => {
                metrics::counter!("analysis_jobs_completed", "mode" => job.mode.to_string())
                    .increment(1);
                match &outcome {
                    JobOutcome::CompletedFast {
                        upgrade_to_id: Some(upgrade),
                        ..
                    } => tracing::info!(
                        job_id = id,
                        upgrade_to_id = upgrade,
                        conditions = ?report.detected_conditions,
                        "Fast pass saved, full pass queued"
                    ),
                    _ => tracing::info!(
                        job_id = id,
                        mode = %job.mode,
                        conditions = ?report.detected_conditions,
                        "Analysis completed"
                    ),
                }
                outcome
            }
            Err(e) => {
                tracing::error!(job_id = id, error = %e, "Failed to store analysis result");
                self.record_failure(
                    job.claim(),
                    job.mode,
                    &format!("Failed to store analysis result: {e}"),
                )
                .await
            }
        }
    }

    async fn record_failure(&self, claim: Claim, mode: AnalysisMode, message: &str) -> JobOutcome {
        let id = claim.id;
        match self.store.mark_failed(claim, message).await {
            Ok(()) => {
                metrics::counter!("analysis_jobs_failed", "mode" => mode.to_string()).increment(1);
                JobOutcome::Failed {
                    id,
                    error: message.to_string(),
                }
            }
            Err(e) => {
                tracing::warn!(job_id = id, error = %e, "Also failed to mark analysis as failed");
                JobOutcome::Unrecorded {
                    id,
                    error: e.to_string(),
                }
            }
        }
    }

    async fn heartbeat(&self) {
        metrics::gauge!("analysis_worker_heartbeat_seconds").set(Utc::now().timestamp() as f64);
        match self.store.pending_count().await {
            Ok(depth) => {
                metrics::gauge!("analysis_queue_depth").set(depth as f64);
                tracing::info!(worker_id = self.id, queue_depth = depth, "Worker heartbeat OK");
            }
            Err(e) => {
                tracing::warn!(worker_id = self.id, error = %e, "Worker heartbeat could not read queue depth");
            }
        }
    }
}

/// Start `count` independent claim loops sharing one store and engine.
pub fn spawn_workers<S, E>(
    count: usize,
    store: S,
    engine: Arc<E>,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>>
where
    S: JobStore + Clone,
    E: AnalysisEngine,
{
    (0..count.max(1))
        .map(|id| {
            let worker = Worker::new(id, store.clone(), Arc::clone(&engine), config.clone());
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        })
        .collect()
}
