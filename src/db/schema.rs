//! Schema guard for the queue columns of `clinical_analyses`.
//!
//! The base table comes from the sqlx migrations; the columns the worker relies
//! on are added here so that older deployments pick them up in place. Every
//! call is idempotent and never fails the caller: a failed step is logged and
//! the guard moves on to the next one, and the returned [`SchemaState`] tells
//! the queue what actually exists.

use sqlx::{PgPool, Row};
use std::collections::BTreeSet;

pub const TABLE: &str = "clinical_analyses";
pub const STATUS_INDEX: &str = "idx_status_created";

/// Columns owned by the guard, with the DDL used to add them.
pub const QUEUE_COLUMNS: &[(&str, &str)] = &[
    ("doctor_id", "BIGINT NULL"),
    ("status", "VARCHAR(20) NOT NULL DEFAULT 'completed'"),
    ("images_json", "JSONB NULL"),
    ("detected_conditions", "JSONB NULL"),
    ("updated_at", "TIMESTAMPTZ NULL"),
    ("error_message", "TEXT NULL"),
    ("mode", "VARCHAR(10) NOT NULL DEFAULT 'full'"),
    ("upgrade_to_id", "BIGINT NULL"),
];

/// Columns whose absence only disables a feature.
const OPTIONAL_COLUMNS: &[&str] = &["doctor_id", "upgrade_to_id"];

// duplicate_table, duplicate_column, unique_violation (racing CREATE INDEX)
const DUPLICATE_CODES: &[&str] = &["42P07", "42701", "23505"];

/// What the guard found (or managed to create) on the job table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaState {
    columns: BTreeSet<String>,
    pub status_index: bool,
}

impl SchemaState {
    /// State of a fully migrated table.
    pub fn complete() -> Self {
        Self {
            columns: QUEUE_COLUMNS.iter().map(|(c, _)| c.to_string()).collect(),
            status_index: true,
        }
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.contains(column)
    }

    /// Fast jobs can spawn a linked full job.
    pub fn supports_upgrade_chain(&self) -> bool {
        self.has_column("upgrade_to_id")
    }

    pub fn supports_doctor_id(&self) -> bool {
        self.has_column("doctor_id")
    }

    /// Required columns the queue cannot work without.
    pub fn missing_required(&self) -> Vec<&'static str> {
        QUEUE_COLUMNS
            .iter()
            .map(|(c, _)| *c)
            .filter(|c| !OPTIONAL_COLUMNS.contains(c) && !self.has_column(c))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.status_index && QUEUE_COLUMNS.iter().all(|(c, _)| self.has_column(c))
    }
}

/// Ensure the queue columns and the `(status, created_at)` index exist.
pub async fn ensure_schema(pool: &PgPool) -> SchemaState {
    match apply(pool).await {
        Ok(state) => {
            if !state.is_complete() {
                tracing::warn!(
                    missing = ?state.missing_required(),
                    status_index = state.status_index,
                    "Schema guard finished with an incomplete queue schema"
                );
            }
            state
        }
        Err(e) => {
            tracing::warn!(error = %e, "Schema guard failed (non-fatal)");
            match inspect(pool).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(error = %e, "Could not inspect queue schema");
                    SchemaState::default()
                }
            }
        }
    }
}

/// Read the current state without changing anything.
pub async fn inspect(pool: &PgPool) -> Result<SchemaState, sqlx::Error> {
    let columns = existing_columns(pool).await?;
    let status_index = index_present(&existing_indexes(pool).await?);
    Ok(SchemaState {
        columns,
        status_index,
    })
}

async fn apply(pool: &PgPool) -> Result<SchemaState, sqlx::Error> {
    let mut columns = existing_columns(pool).await?;

    for (column, ddl) in QUEUE_COLUMNS {
        if columns.contains(*column) {
            continue;
        }
        let statement = format!("ALTER TABLE {TABLE} ADD COLUMN {column} {ddl}");
        let result = sqlx::query(&statement).execute(pool).await;
        if settled(column, result) {
            columns.insert(column.to_string());
        }
    }

    let mut status_index = index_present(&existing_indexes(pool).await?);
    if !status_index {
        let statement = format!("CREATE INDEX {STATUS_INDEX} ON {TABLE} (status, created_at)");
        let result = sqlx::query(&statement).execute(pool).await;
        status_index = settled(STATUS_INDEX, result);
    }

    Ok(SchemaState {
        columns,
        status_index,
    })
}

/// Whether one DDL step left `object` in place.
fn settled<T>(object: &str, result: Result<T, sqlx::Error>) -> bool {
    match result {
        Ok(_) => {
            tracing::info!(object = %object, "Schema guard created queue object");
            true
        }
        Err(e) if is_duplicate(&e) => {
            tracing::debug!(object = %object, "Queue object created concurrently");
            true
        }
        Err(e) => {
            tracing::warn!(object = %object, error = %e, "Schema guard step failed, continuing");
            false
        }
    }
}

async fn existing_columns(pool: &PgPool) -> Result<BTreeSet<String>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT column_name::text AS column_name
        FROM information_schema.columns
        WHERE table_schema = current_schema() AND table_name = $1
        "#,
    )
    .bind(TABLE)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| r.try_get::<String, _>("column_name"))
        .collect()
}

async fn existing_indexes(pool: &PgPool) -> Result<Vec<(String, Vec<String>)>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT i.relname::text AS index_name,
               array_agg(a.attname::text ORDER BY k.ord) AS columns
        FROM pg_index x
        JOIN pg_class t ON t.oid = x.indrelid
        JOIN pg_class i ON i.oid = x.indexrelid
        JOIN pg_namespace n ON n.oid = t.relnamespace
        CROSS JOIN LATERAL unnest(x.indkey) WITH ORDINALITY AS k(attnum, ord)
        JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
        WHERE t.relname = $1 AND n.nspname = current_schema()
        GROUP BY i.relname
        "#,
    )
    .bind(TABLE)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| Ok((r.try_get("index_name")?, r.try_get("columns")?)))
        .collect()
}

/// The claim index counts as present under its own name or as any index on
/// exactly `(status, created_at)`.
fn index_present(indexes: &[(String, Vec<String>)]) -> bool {
    indexes
        .iter()
        .any(|(name, cols)| name == STATUS_INDEX || cols == &["status", "created_at"])
}

fn is_duplicate(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| DUPLICATE_CODES.contains(&code.as_ref()))
}
