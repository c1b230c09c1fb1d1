//! Namespaced JSON records in the `kv` table.
//!
//! The free functions take a plain `&Connection` so several of them can be
//! composed inside one transaction; the `Database` methods are conveniences
//! for single reads.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

use crate::db::{helpers::parse_json, Database, Namespace};

pub fn get_json<T: DeserializeOwned>(conn: &Connection, key: &str) -> Result<Option<T>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()
        .with_context(|| format!("failed to read {key}"))?;

    raw.map(|value| parse_json(&value, key)).transpose()
}

pub fn put_json<T: Serialize>(conn: &Connection, key: &str, value: &T, now_ms: i64) -> Result<()> {
    let serialized = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO kv (key, value, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET
             value = excluded.value,
             updated_at = excluded.updated_at",
        params![key, serialized, now_ms],
    )
    .with_context(|| format!("failed to write {key}"))?;
    Ok(())
}

/// Returns whether a row was removed.
pub fn delete(conn: &Connection, key: &str) -> Result<bool> {
    let removed = conn
        .execute("DELETE FROM kv WHERE key = ?1", params![key])
        .with_context(|| format!("failed to delete {key}"))?;
    Ok(removed > 0)
}

/// All records in `namespace`, ordered by key, as `(id, value)` pairs.
pub fn scan<T: DeserializeOwned>(conn: &Connection, namespace: Namespace) -> Result<Vec<(String, T)>> {
    let prefix = namespace.prefix();
    let mut stmt = conn.prepare(
        "SELECT key, value FROM kv
         WHERE substr(key, 1, length(?1)) = ?1
         ORDER BY key",
    )?;

    let rows = stmt
        .query_map(params![prefix], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(key, value)| {
            let id = namespace.id_from(&key).unwrap_or(key.as_str()).to_string();
            let parsed = parse_json(&value, &key)?;
            Ok((id, parsed))
        })
        .collect()
}

pub fn delete_namespace(conn: &Connection, namespace: Namespace) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM kv WHERE substr(key, 1, length(?1)) = ?1",
        params![namespace.prefix()],
    )?;
    Ok(removed)
}

impl Database {
    pub async fn get_record<T>(&self, namespace: Namespace, id: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let key = namespace.key(id);
        self.execute(move |conn| get_json(conn, &key)).await
    }

    pub async fn list_records<T>(&self, namespace: Namespace) -> Result<Vec<(String, T)>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.execute(move |conn| scan(conn, namespace)).await
    }
}
