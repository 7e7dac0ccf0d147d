//! Database access for relink-matcher
//!
//! All durable state lives in one SQLite file: entity-store tables
//! (projects, entries, tasks, candidates) and the broker tables (jobs,
//! dead_letter_jobs). Timestamps are RFC3339 UTC text with fixed
//! microsecond width, so lexicographic comparison in SQL matches
//! chronological order. UUIDs are stored as text.

pub mod candidates;
pub mod entries;
pub mod projects;
pub mod queue;
pub mod tasks;

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Initialize database connection pool
///
/// Connects to relink.db under the root folder, creating the file and the
/// schema on first run.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // mode=rwc: read, write, create
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;

    init_schema(&pool).await?;

    Ok(pool)
}

/// Create all tables and indexes if they don't exist
///
/// Public so tests can run it against in-memory or temp-file databases.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            status TEXT NOT NULL DEFAULT 'draft',
            scoring_config TEXT,
            soft_deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL REFERENCES projects(id),
            display_name TEXT NOT NULL,
            attributes TEXT NOT NULL DEFAULT '{}',
            external_ref TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_project ON entries(project_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL REFERENCES projects(id),
            entry_id TEXT NOT NULL REFERENCES entries(id),
            status TEXT NOT NULL DEFAULT 'new',
            accepted_candidate_id TEXT,
            accepted_entity_id TEXT,
            candidate_count INTEGER NOT NULL DEFAULT 0,
            highest_score INTEGER,
            error_message TEXT,
            processed_at TEXT,
            reviewed_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(project_id, entry_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tasks_project_status ON tasks(project_id, status)",
    )
    .execute(pool)
    .await?;

    // Sweeper scans by (status, updated_at)
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tasks_status_updated ON tasks(status, updated_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS candidates (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks(id),
            entity_id TEXT NOT NULL,
            label TEXT,
            description TEXT,
            status TEXT NOT NULL DEFAULT 'suggested',
            source TEXT NOT NULL DEFAULT 'automated_search',
            score INTEGER NOT NULL DEFAULT 0,
            score_breakdown TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_candidates_task ON candidates(task_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            job_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            attempt INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            status TEXT NOT NULL DEFAULT 'queued',
            available_at TEXT NOT NULL,
            locked_at TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_jobs_status_available ON jobs(status, available_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dead_letter_jobs (
            id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL UNIQUE,
            job_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            error_message TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!(
        "Database schema initialized (projects, entries, tasks, candidates, jobs, dead_letter_jobs)"
    );

    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    // One connection: each new connection to sqlite::memory: is a fresh
    // empty database.
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create test database");
    init_schema(&pool).await.expect("Failed to init schema");
    pool
}
