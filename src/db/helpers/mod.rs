use std::convert::TryFrom;

use anyhow::{anyhow, Context, Result};
use rusqlite::Transaction;
use std::time::Instant;

use crate::error::SyncError;

pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

pub fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{field} contains negative value {value}"))
}

pub fn parse_json<T: serde::de::DeserializeOwned>(raw: &str, field: &str) -> Result<T> {
    serde_json::from_str(raw).with_context(|| format!("failed to parse {field}"))
}

/// Commit only while `deadline` has not passed; otherwise roll back and
/// report a timeout so the caller never sees a late commit it gave up on.
pub fn commit_before(tx: Transaction<'_>, deadline: Instant, timeout_ms: u64) -> Result<()> {
    if Instant::now() >= deadline {
        tx.rollback().context("failed to roll back expired transaction")?;
        return Err(SyncError::WriteTimeout { timeout_ms }.into());
    }
    tx.commit().map_err(|err| SyncError::durable(err).into())
}
