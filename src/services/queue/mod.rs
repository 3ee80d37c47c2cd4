//! Job store backends for the analysis queue.
//!
//! The `clinical_analyses` table is both the request log and the work queue.
//! [`JobStore`] is the seam the worker talks to:
//! - [`PgJobStore`] - PostgreSQL, row-locking claim with `SKIP LOCKED`
//! - [`MemoryJobStore`] - in-process table with the same semantics, for tests
//!   and single-process development

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::models::job::{Claim, ClaimedJob};

mod memory;
mod postgres;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

/// Storage contract used by the claim loop and the result writer.
///
/// Every status change goes through these methods; nothing else writes
/// `status`. Result writes take the [`Claim`] returned by `claim_next` and
/// fail with [`QueueError::NotClaimed`] once the row has moved on.
pub trait JobStore: Send + Sync + 'static {
    /// Run before claiming starts (schema checks and the like).
    fn prepare(&self) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Atomically take the oldest claimable row and mark it `processing`.
    ///
    /// Returns `Ok(None)` when the queue is empty.
    fn claim_next(&self) -> impl Future<Output = Result<Option<ClaimedJob>, QueueError>> + Send;

    /// `processing -> completed`.
    fn mark_completed(
        &self,
        claim: Claim,
        analysis: &str,
        detected_conditions: &[String],
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// `processing -> completed_fast`, spawning the linked full job when the
    /// store supports the upgrade chain. Returns the new job's id.
    fn mark_completed_fast(
        &self,
        claim: Claim,
        analysis: &str,
        detected_conditions: &[String],
    ) -> impl Future<Output = Result<Option<i64>, QueueError>> + Send;

    /// `processing -> failed` with a diagnostic. `analysis` is left untouched.
    fn mark_failed(
        &self,
        claim: Claim,
        error_message: &str,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Number of rows waiting to be claimed.
    fn pending_count(&self) -> impl Future<Output = Result<i64, QueueError>> + Send;

    /// Wait until a job might be available or the timeout expires.
    fn wait_for_job(&self, timeout: Duration) -> impl Future<Output = ()> + Send {
        async move {
            tokio::time::sleep(timeout).await;
        }
    }
}

impl<S: JobStore> JobStore for Arc<S> {
    fn prepare(&self) -> impl Future<Output = ()> + Send {
        self.as_ref().prepare()
    }

    fn claim_next(&self) -> impl Future<Output = Result<Option<ClaimedJob>, QueueError>> + Send {
        self.as_ref().claim_next()
    }

    fn mark_completed(
        &self,
        claim: Claim,
        analysis: &str,
        detected_conditions: &[String],
    ) -> impl Future<Output = Result<(), QueueError>> + Send {
        self.as_ref().mark_completed(claim, analysis, detected_conditions)
    }

    fn mark_completed_fast(
        &self,
        claim: Claim,
        analysis: &str,
        detected_conditions: &[String],
    ) -> impl Future<Output = Result<Option<i64>, QueueError>> + Send {
        self.as_ref().mark_completed_fast(claim, analysis, detected_conditions)
    }

    fn mark_failed(
        &self,
        claim: Claim,
        error_message: &str,
    ) -> impl Future<Output = Result<(), QueueError>> + Send {
        self.as_ref().mark_failed(claim, error_message)
    }

    fn pending_count(&self) -> impl Future<Output = Result<i64, QueueError>> + Send {
        self.as_ref().pending_count()
    }

    fn wait_for_job(&self, timeout: Duration) -> impl Future<Output = ()> + Send {
        self.as_ref().wait_for_job(timeout)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A guarded update found the row outside `processing`, or reclaimed by
    /// another worker.
    #[error("Analysis {0} is not claimed by this worker")]
    NotClaimed(i64),
}
