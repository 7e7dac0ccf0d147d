//! Project persistence
//!
//! Status changes always go through `conditional_update_project_status`;
//! the WHERE clause on the expected status is what makes concurrent
//! coordinator/API writes safe.

use crate::models::{Project, ProjectStatus};
use relink_common::{time, uuid_utils, Result};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

fn project_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Project> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let scoring_config: Option<String> = row.get("scoring_config");
    let scoring_config: Option<serde_json::Value> = scoring_config
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Project {
        id: uuid_utils::parse(&id)?,
        name: row.get("name"),
        description: row.get("description"),
        status: status.parse()?,
        scoring_config,
        soft_deleted: row.get::<i64, _>("soft_deleted") != 0,
        created_at: time::parse_db_timestamp(&created_at)?,
        updated_at: time::parse_db_timestamp(&updated_at)?,
    })
}

/// Insert a new project in status `draft`
pub async fn create_project(
    pool: &SqlitePool,
    name: &str,
    description: Option<&str>,
    scoring_config: Option<&serde_json::Value>,
) -> Result<Project> {
    let id = uuid_utils::generate();
    let now = time::now();
    let now_str = time::to_db_timestamp(&now);
    let scoring_json = scoring_config.map(|v| v.to_string());

    sqlx::query(
        r#"
        INSERT INTO projects (id, name, description, status, scoring_config, soft_deleted, created_at, updated_at)
        VALUES (?, ?, ?, 'draft', ?, 0, ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(name)
    .bind(description)
    .bind(&scoring_json)
    .bind(&now_str)
    .bind(&now_str)
    .execute(pool)
    .await?;

    Ok(Project {
        id,
        name: name.to_string(),
        description: description.map(|s| s.to_string()),
        status: ProjectStatus::Draft,
        scoring_config: scoring_config.cloned(),
        soft_deleted: false,
        created_at: now,
        updated_at: now,
    })
}

pub async fn get_project(pool: &SqlitePool, id: Uuid) -> Result<Option<Project>> {
    let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(project_from_row).transpose()
}

/// Optimistic status write. Returns the number of rows changed: 0 means the
/// project was no longer in `expected` and nothing was written.
pub async fn conditional_update_project_status(
    pool: &SqlitePool,
    id: Uuid,
    expected: ProjectStatus,
    new: ProjectStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE projects SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(new.as_str())
    .bind(time::now_db_timestamp())
    .bind(id.to_string())
    .bind(expected.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Projects sitting in `processing` since before `cutoff`, for the
/// sweeper's completion-check backstop
pub async fn stalled_processing_projects(
    pool: &SqlitePool,
    cutoff: &chrono::DateTime<chrono::Utc>,
) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        "SELECT id FROM projects
         WHERE status = 'processing' AND soft_deleted = 0 AND updated_at < ?
         ORDER BY updated_at, id",
    )
    .bind(time::to_db_timestamp(cutoff))
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| uuid_utils::parse(row.get::<String, _>("id").as_str()))
        .collect()
}

/// Flag a project soft-deleted; pipeline and list queries exclude it from
/// then on. Rows are never hard-deleted while tasks reference them.
pub async fn set_project_soft_deleted(pool: &SqlitePool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE projects SET soft_deleted = 1, updated_at = ? WHERE id = ? AND soft_deleted = 0",
    )
    .bind(time::now_db_timestamp())
    .bind(id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn test_create_and_get_project() {
        let pool = test_pool().await;
        let created = create_project(&pool, "census-1901", Some("test batch"), None)
            .await
            .unwrap();
        assert_eq!(created.status, ProjectStatus::Draft);

        let loaded = get_project(&pool, created.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, created.id);
        assert_eq!(loaded.name, "census-1901");
        assert_eq!(loaded.description.as_deref(), Some("test batch"));
        assert!(!loaded.soft_deleted);
        assert!(loaded.scoring_config.is_none());
    }

    #[tokio::test]
    async fn test_scoring_config_round_trip() {
        let pool = test_pool().await;
        let config = serde_json::json!({"name_weight": 0.5, "date_weight": 0.5});
        let created = create_project(&pool, "weighted", None, Some(&config))
            .await
            .unwrap();

        let loaded = get_project(&pool, created.id).await.unwrap().unwrap();
        assert_eq!(loaded.scoring_config, Some(config));
    }

    #[tokio::test]
    async fn test_conditional_update_respects_expected_status() {
        let pool = test_pool().await;
        let project = create_project(&pool, "p", None, None).await.unwrap();

        let rows = conditional_update_project_status(
            &pool,
            project.id,
            ProjectStatus::Draft,
            ProjectStatus::Active,
        )
        .await
        .unwrap();
        assert_eq!(rows, 1);

        // second writer expecting the old status loses
        let rows = conditional_update_project_status(
            &pool,
            project.id,
            ProjectStatus::Draft,
            ProjectStatus::Active,
        )
        .await
        .unwrap();
        assert_eq!(rows, 0);

        let loaded = get_project(&pool, project.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ProjectStatus::Active);
    }

    #[tokio::test]
    async fn test_soft_delete_is_idempotent() {
        let pool = test_pool().await;
        let project = create_project(&pool, "p", None, None).await.unwrap();

        assert_eq!(set_project_soft_deleted(&pool, project.id).await.unwrap(), 1);
        assert_eq!(set_project_soft_deleted(&pool, project.id).await.unwrap(), 0);

        let loaded = get_project(&pool, project.id).await.unwrap().unwrap();
        assert!(loaded.soft_deleted);
    }
}
