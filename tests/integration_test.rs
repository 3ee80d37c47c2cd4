//! Queue integration tests against a real PostgreSQL.
//!
//! Each test runs in its own schema (set through `search_path`) so the FIFO
//! and concurrency assertions do not see rows from other tests.
//!
//! Run with: DATABASE_URL=postgres://... cargo test --test integration_test -- --ignored

use rounds_iq::{
    db::{self, queries, schema},
    models::job::{AnalysisMode, Claim, JobStatus, NewAnalysis},
    services::{
        analysis::{AnalysisEngine, AnalysisError, AnalysisReport, AnalysisRequest},
        prompts,
        queue::{JobStore, PgJobStore, QueueError},
        worker::{JobOutcome, Worker, WorkerConfig},
    },
};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

static SCHEMA_SEQ: AtomicU32 = AtomicU32::new(0);

struct TestDb {
    pool: PgPool,
    schema_name: String,
}

impl TestDb {
    async fn new() -> Self {
        dotenvy::dotenv().ok();
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let schema_name = format!(
            "rq_test_{}_{}",
            std::process::id(),
            SCHEMA_SEQ.fetch_add(1, Ordering::SeqCst)
        );

        let admin = db::init_pool(&url)
            .await
            .expect("Failed to connect to database");
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema_name}"))
            .execute(&admin)
            .await
            .expect("Failed to create test schema");
        admin.close().await;

        let options = PgConnectOptions::from_str(&url)
            .expect("Invalid DATABASE_URL")
            .options([("search_path", schema_name.as_str())]);
        let pool = PgPoolOptions::new()
            .max_connections(12)
            .connect_with(options)
            .await
            .expect("Failed to connect to test schema");

        db::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");

        Self { pool, schema_name }
    }

    async fn store(&self) -> PgJobStore {
        let state = schema::ensure_schema(&self.pool).await;
        assert!(state.is_complete(), "schema guard left {state:?}");
        PgJobStore::new(self.pool.clone(), state)
    }

    async fn cleanup(self) {
        sqlx::query(&format!("DROP SCHEMA {} CASCADE", self.schema_name))
            .execute(&self.pool)
            .await
            .expect("Failed to drop test schema");
        self.pool.close().await;
    }
}

struct StubEngine;

impl AnalysisEngine for StubEngine {
    async fn analyze(&self, request: AnalysisRequest<'_>) -> Result<AnalysisReport, AnalysisError> {
        if request.note.contains("FAIL") {
            return Err(AnalysisError::EmptyResponse);
        }
        Ok(AnalysisReport {
            text: format!("{} analysis", request.mode),
            detected_conditions: prompts::detect_conditions(request.note),
        })
    }
}

fn worker(store: Arc<PgJobStore>) -> Worker<Arc<PgJobStore>, StubEngine> {
    Worker::new(0, store, Arc::new(StubEngine), WorkerConfig::default())
}

async fn queue(db: &TestDb, store: &PgJobStore, note: &str, mode: AnalysisMode) -> i64 {
    let mut new = NewAnalysis::new(note, "general", mode);
    new.images = vec!["data:image/png;base64,iVBORw0KGgo=".to_string()];
    queries::create_analysis(&db.pool, &store.schema().await, &new)
        .await
        .expect("Failed to queue analysis")
}

async fn status_of(db: &TestDb, store: &PgJobStore, id: i64) -> JobStatus {
    queries::get_analysis(&db.pool, &store.schema().await, id)
        .await
        .expect("Failed to read analysis")
        .expect("Analysis missing")
        .status
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_schema_guard_is_idempotent() {
    let db = TestDb::new().await;

    let first = schema::ensure_schema(&db.pool).await;
    let second = schema::ensure_schema(&db.pool).await;
    assert!(first.is_complete());
    assert_eq!(first, second);
    assert_eq!(schema::inspect(&db.pool).await.unwrap(), second);

    let index_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pg_indexes WHERE schemaname = current_schema() AND indexname = 'idx_status_created'",
    )
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(index_count, 1);

    db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_schema_guard_accepts_equivalent_index() {
    let db = TestDb::new().await;

    sqlx::query("ALTER TABLE clinical_analyses ADD COLUMN status VARCHAR(20) NOT NULL DEFAULT 'completed'")
        .execute(&db.pool)
        .await
        .unwrap();
    sqlx::query("CREATE INDEX ix_queue_order ON clinical_analyses (status, created_at)")
        .execute(&db.pool)
        .await
        .unwrap();

    let state = schema::ensure_schema(&db.pool).await;
    assert!(state.is_complete());

    let guard_index: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pg_indexes WHERE schemaname = current_schema() AND indexname = 'idx_status_created'",
    )
    .fetch_one(&db.pool)
    .await
    .unwrap();
    assert_eq!(guard_index, 0);

    db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_claim_runs_guard_when_startup_state_is_incomplete() {
    let db = TestDb::new().await;

    // As if the startup guard had failed: only the migrated base columns.
    let store = PgJobStore::new(db.pool.clone(), schema::SchemaState::default());
    assert!(!store.schema().await.is_complete());

    assert!(store.claim_next().await.unwrap().is_none());
    assert!(store.schema().await.is_complete());

    let id = queue(&db, &store, "Xia, note", AnalysisMode::Full).await;
    assert_eq!(store.claim_next().await.unwrap().unwrap().id, id);

    db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_oldest_pending_row_is_claimed_first() {
    let db = TestDb::new().await;
    let store = db.store().await;

    let b = queue(&db, &store, "B, later note", AnalysisMode::Full).await;
    let a = queue(&db, &store, "A, earlier note", AnalysisMode::Full).await;
    sqlx::query("UPDATE clinical_analyses SET created_at = NOW() - INTERVAL '5 seconds' WHERE id = $1")
        .bind(a)
        .execute(&db.pool)
        .await
        .unwrap();

    let claimed = store.claim_next().await.unwrap().expect("expected a job");
    assert_eq!(claimed.id, a);
    assert_eq!(status_of(&db, &store, a).await, JobStatus::Processing);
    assert_eq!(status_of(&db, &store, b).await, JobStatus::Pending);

    db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_concurrent_claimants_never_share_a_row() {
    let db = TestDb::new().await;
    let store = Arc::new(db.store().await);

    let mut queued = HashSet::new();
    for i in 0..40 {
        queued.insert(queue(&db, &store, &format!("P{i}, note"), AnalysisMode::Full).await);
    }

    let claimants: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(job) = store.claim_next().await.unwrap() {
                    ids.push(job.id);
                }
                ids
            })
        })
        .collect();

    let mut claimed = Vec::new();
    for ids in futures::future::join_all(claimants).await {
        claimed.extend(ids.unwrap());
    }

    let unique: HashSet<i64> = claimed.iter().copied().collect();
    assert_eq!(unique.len(), claimed.len(), "a row was claimed twice");
    assert_eq!(unique, queued);

    db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_fast_job_spawns_one_full_follow_up() {
    let db = TestDb::new().await;
    let store = Arc::new(db.store().await);
    let w = worker(Arc::clone(&store));

    let id = queue(&db, &store, "Rosa, septic shock", AnalysisMode::Fast).await;

    let Some(JobOutcome::CompletedFast {
        upgrade_to_id: Some(upgrade),
        ..
    }) = w.run_once().await.unwrap()
    else {
        panic!("expected a fast completion with a follow-up");
    };

    let schema_state = store.schema().await;
    let original = queries::get_analysis(&db.pool, &schema_state, id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(original.status, JobStatus::CompletedFast);
    assert_eq!(original.upgrade_to_id, Some(upgrade));
    assert_eq!(original.analysis.as_deref(), Some("fast analysis"));
    assert_eq!(original.detected_conditions, vec!["sepsis".to_string()]);

    let follow_up = queries::get_analysis(&db.pool, &schema_state, upgrade)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(follow_up.status, JobStatus::Pending);
    assert_eq!(follow_up.mode, AnalysisMode::Full);
    assert_eq!(follow_up.note, original.note);
    assert_eq!(follow_up.images, original.images);
    assert!(follow_up.analysis.is_none());

    // Linking is one-shot.
    let replay = Claim {
        id,
        claimed_at: chrono::Utc::now(),
    };
    assert!(matches!(
        store.mark_completed_fast(replay, "again", &[]).await,
        Err(QueueError::NotClaimed(_))
    ));

    assert_eq!(
        w.run_once().await.unwrap(),
        Some(JobOutcome::Completed { id: upgrade })
    );
    assert_eq!(status_of(&db, &store, upgrade).await, JobStatus::Completed);

    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM clinical_analyses")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(total, 2);

    db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_fast_job_without_upgrade_column() {
    let db = TestDb::new().await;
    db.store().await;
    sqlx::query("ALTER TABLE clinical_analyses DROP COLUMN upgrade_to_id")
        .execute(&db.pool)
        .await
        .unwrap();
    let state = schema::inspect(&db.pool).await.unwrap();
    assert!(!state.supports_upgrade_chain());

    let store = Arc::new(PgJobStore::new(db.pool.clone(), state));
    let id = queue(&db, &store, "Tom, cough", AnalysisMode::Fast).await;

    assert_eq!(
        worker(Arc::clone(&store)).run_once().await.unwrap(),
        Some(JobOutcome::CompletedFast {
            id,
            upgrade_to_id: None
        })
    );
    assert_eq!(status_of(&db, &store, id).await, JobStatus::CompletedFast);

    db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_engine_failure_is_recorded() {
    let db = TestDb::new().await;
    let store = Arc::new(db.store().await);
    let id = queue(&db, &store, "Uma, FAIL", AnalysisMode::Full).await;

    let outcome = worker(Arc::clone(&store)).run_once().await.unwrap();
    assert!(matches!(outcome, Some(JobOutcome::Failed { .. })));

    let row = queries::get_analysis(&db.pool, &store.schema().await, id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, JobStatus::Failed);
    assert!(row.analysis.is_none());
    assert_eq!(
        row.error_message.as_deref(),
        Some("LLM API returned an empty completion")
    );

    let stats = queries::worker_stats(&db.pool).await.unwrap();
    assert_eq!((stats.pending, stats.processing, stats.failed), (0, 0, 1));

    db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_processing_lease_reclaims_stale_rows() {
    let db = TestDb::new().await;
    let plain = db.store().await;
    let id = queue(&db, &plain, "Vic, note", AnalysisMode::Full).await;
    let stale = plain.claim_next().await.unwrap().unwrap();
    assert_eq!(stale.id, id);

    sqlx::query("UPDATE clinical_analyses SET updated_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(id)
        .execute(&db.pool)
        .await
        .unwrap();

    // Without a lease an orphaned row stays put.
    assert!(plain.claim_next().await.unwrap().is_none());

    let leased = db
        .store()
        .await
        .with_processing_lease(Some(Duration::from_secs(60)));
    let reclaimed = leased.claim_next().await.unwrap().unwrap();
    assert_eq!(reclaimed.id, id);
    assert!(leased.claim_next().await.unwrap().is_none());

    // Only the new owner can record an outcome.
    assert!(matches!(
        plain.mark_failed(stale.claim(), "timed out").await,
        Err(QueueError::NotClaimed(_))
    ));
    leased
        .mark_completed(reclaimed.claim(), "report", &[])
        .await
        .unwrap();
    assert_eq!(status_of(&db, &leased, id).await, JobStatus::Completed);

    db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_history_compare_and_prompt_modifier() {
    let db = TestDb::new().await;
    let store = db.store().await;

    let first = queue(&db, &store, "Walt, chest pain", AnalysisMode::Full).await;
    let second = queries::insert_completed(
        &db.pool,
        &store.schema().await,
        &NewAnalysis::new("Walt, follow-up", "cardiology", AnalysisMode::Full),
        "report",
        &[],
    )
    .await
    .unwrap();

    let history = queries::patient_history(&db.pool, "Walt").await.unwrap();
    let ids: HashSet<i64> = history.iter().map(|h| h.id).collect();
    assert_eq!(ids, HashSet::from([first, second]));

    let record = queries::comparison_record(&db.pool, second)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.analysis.as_deref(), Some("report"));
    assert!(queries::comparison_record(&db.pool, 999_999)
        .await
        .unwrap()
        .is_none());

    sqlx::query("INSERT INTO specialties (name, slug, prompt_modifier) VALUES ('Cardiology', 'cardiology', 'Focus on ACS pathways.'), ('General', 'general', '  ')")
        .execute(&db.pool)
        .await
        .unwrap();
    assert_eq!(
        queries::get_prompt_modifier(&db.pool, "cardiology")
            .await
            .unwrap()
            .as_deref(),
        Some("Focus on ACS pathways.")
    );
    assert_eq!(queries::get_prompt_modifier(&db.pool, "general").await.unwrap(), None);
    assert_eq!(queries::get_prompt_modifier(&db.pool, "unknown").await.unwrap(), None);

    db.cleanup().await;
}
