//! Entry persistence

use crate::models::Entry;
use relink_common::{time, uuid_utils, Result};
use serde::Deserialize;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Caller-supplied entry fields for bulk ingestion
#[derive(Debug, Clone, Deserialize)]
pub struct NewEntry {
    pub display_name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub external_ref: Option<String>,
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Entry> {
    let id: String = row.get("id");
    let project_id: String = row.get("project_id");
    let attributes: String = row.get("attributes");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Entry {
        id: uuid_utils::parse(&id)?,
        project_id: uuid_utils::parse(&project_id)?,
        display_name: row.get("display_name"),
        attributes: serde_json::from_str(&attributes)?,
        external_ref: row.get("external_ref"),
        created_at: time::parse_db_timestamp(&created_at)?,
        updated_at: time::parse_db_timestamp(&updated_at)?,
    })
}

/// Bulk-insert entries for a project in one transaction. Returns the
/// inserted entry IDs in input order.
pub async fn insert_entries(
    pool: &SqlitePool,
    project_id: Uuid,
    entries: &[NewEntry],
) -> Result<Vec<Uuid>> {
    let now_str = time::now_db_timestamp();
    let project_id_str = project_id.to_string();
    let mut ids = Vec::with_capacity(entries.len());

    let mut tx = pool.begin().await?;
    for entry in entries {
        let id = uuid_utils::generate();
        let attributes = serde_json::to_string(&entry.attributes)?;
        sqlx::query(
            r#"
            INSERT INTO entries (id, project_id, display_name, attributes, external_ref, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&project_id_str)
        .bind(&entry.display_name)
        .bind(&attributes)
        .bind(&entry.external_ref)
        .bind(&now_str)
        .bind(&now_str)
        .execute(&mut *tx)
        .await?;
        ids.push(id);
    }
    tx.commit().await?;

    Ok(ids)
}

pub async fn get_entry(pool: &SqlitePool, id: Uuid) -> Result<Option<Entry>> {
    let row = sqlx::query("SELECT * FROM entries WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(entry_from_row).transpose()
}

/// IDs of entries in a project that have no task yet. Feeds project start,
/// which only creates the missing tasks.
pub async fn entry_ids_without_task(pool: &SqlitePool, project_id: Uuid) -> Result<Vec<Uuid>> {
    let rows = sqlx::query(
        r#"
        SELECT e.id FROM entries e
        LEFT JOIN tasks t ON t.entry_id = e.id AND t.project_id = e.project_id
        WHERE e.project_id = ? AND t.id IS NULL
        ORDER BY e.created_at, e.id
        "#,
    )
    .bind(project_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| uuid_utils::parse(&row.get::<String, _>("id")))
        .collect()
}

pub async fn count_entries(pool: &SqlitePool, project_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries WHERE project_id = ?")
        .bind(project_id.to_string())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{projects, test_pool};

    fn sample_entries() -> Vec<NewEntry> {
        vec![
            NewEntry {
                display_name: "Wayne Gretzky".to_string(),
                attributes: BTreeMap::from([(
                    "date_of_birth".to_string(),
                    "1961-01-26".to_string(),
                )]),
                external_ref: Some("row-17".to_string()),
            },
            NewEntry {
                display_name: "Gordie Howe".to_string(),
                attributes: BTreeMap::new(),
                external_ref: None,
            },
        ]
    }

    #[tokio::test]
    async fn test_insert_and_get_entries() {
        let pool = test_pool().await;
        let project = projects::create_project(&pool, "p", None, None).await.unwrap();

        let ids = insert_entries(&pool, project.id, &sample_entries()).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(count_entries(&pool, project.id).await.unwrap(), 2);

        let entry = get_entry(&pool, ids[0]).await.unwrap().unwrap();
        assert_eq!(entry.display_name, "Wayne Gretzky");
        assert_eq!(entry.attribute("date_of_birth"), Some("1961-01-26"));
        assert_eq!(entry.external_ref.as_deref(), Some("row-17"));
    }

    #[tokio::test]
    async fn test_entry_ids_without_task() {
        let pool = test_pool().await;
        let project = projects::create_project(&pool, "p", None, None).await.unwrap();
        let ids = insert_entries(&pool, project.id, &sample_entries()).await.unwrap();

        let mut missing = entry_ids_without_task(&pool, project.id).await.unwrap();
        missing.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(missing, expected);

        crate::db::tasks::create_tasks_for_entries(&pool, project.id, &ids[..1])
            .await
            .unwrap();
        let missing = entry_ids_without_task(&pool, project.id).await.unwrap();
        assert_eq!(missing, vec![ids[1]]);
    }
}
