use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{helpers::parse_json, Database};
use crate::models::TrackedEntity;

fn row_to_entity(row: &Row) -> Result<TrackedEntity> {
    let id: String = row.get("id")?;
    let state: String = row.get("state")?;

    Ok(TrackedEntity {
        display_name: row.get("display_name")?,
        kind: parse_json(&state, "entity state")?,
        updated_at: row.get("updated_at")?,
        id,
    })
}

pub fn get_entity(conn: &Connection, entity_id: &str) -> Result<Option<TrackedEntity>> {
    let mut stmt = conn.prepare(
        "SELECT id, display_name, kind, state, updated_at
         FROM entities
         WHERE id = ?1",
    )?;

    let mut rows = stmt.query(params![entity_id])?;
    let entity = match rows.next()? {
        Some(row) => Some(row_to_entity(row)?),
        None => None,
    };
    Ok(entity)
}

pub fn list_entities(conn: &Connection, ids: &[String]) -> Result<Vec<TrackedEntity>> {
    let mut entities = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(entity) = get_entity(conn, id)? {
            entities.push(entity);
        }
    }
    Ok(entities)
}

pub fn upsert_entity(conn: &Connection, entity: &TrackedEntity) -> Result<()> {
    let state = serde_json::to_string(&entity.kind)?;
    conn.execute(
        "INSERT INTO entities (id, display_name, kind, state, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
             display_name = excluded.display_name,
             kind = excluded.kind,
             state = excluded.state,
             updated_at = excluded.updated_at",
        params![
            entity.id,
            entity.display_name,
            entity.kind.as_str(),
            state,
            entity.updated_at,
        ],
    )
    .with_context(|| format!("failed to persist entity {}", entity.id))?;
    Ok(())
}

impl Database {
    /// Create or replace an entity. This is the entry point for main-app
    /// collaborators (CRUD screens, shortcuts) that create records.
    pub async fn save_entity(&self, entity: &TrackedEntity) -> Result<()> {
        let record = entity.clone();
        self.write(move |tx| upsert_entity(tx, &record)).await
    }

    pub async fn get_entity(&self, entity_id: &str) -> Result<Option<TrackedEntity>> {
        let entity_id = entity_id.to_string();
        self.execute(move |conn| get_entity(conn, &entity_id)).await
    }

    pub async fn list_entities(&self, ids: Vec<String>) -> Result<Vec<TrackedEntity>> {
        self.execute(move |conn| list_entities(conn, &ids)).await
    }

    pub async fn entity_exists(&self, entity_id: &str) -> Result<bool> {
        let entity_id = entity_id.to_string();
        self.execute(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM entities WHERE id = ?1",
                    params![entity_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }
}
