use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::db::{
    helpers::{to_i64, to_u64},
    Database,
};
use crate::models::CompletedSession;

/// Insert unless a record with the same completion id already exists.
/// Returns whether a new row was written.
pub fn insert_completion(conn: &Connection, session: &CompletedSession, applied_at: i64) -> Result<bool> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO completed_sessions
                 (completion_id, entity_id, elapsed_seconds, completed_at, applied_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.completion_id,
                session.entity_id,
                to_i64(session.elapsed_seconds)?,
                session.completed_at,
                applied_at,
            ],
        )
        .with_context(|| format!("failed to record completion {}", session.completion_id))?;
    Ok(inserted > 0)
}

impl Database {
    pub async fn list_completions(&self, entity_id: &str) -> Result<Vec<CompletedSession>> {
        let entity_id = entity_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT completion_id, entity_id, elapsed_seconds, completed_at
                 FROM completed_sessions
                 WHERE entity_id = ?1
                 ORDER BY completed_at ASC",
            )?;

            let mut rows = stmt.query(params![entity_id])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(CompletedSession {
                    completion_id: row.get(0)?,
                    entity_id: row.get(1)?,
                    elapsed_seconds: to_u64(row.get::<_, i64>(2)?, "elapsed_seconds")?,
                    completed_at: row.get(3)?,
                });
            }
            Ok(sessions)
        })
        .await
    }
}
