//! Pending-change ledger.
//!
//! One `ledger:<entityId>` record per touched entity, holding the net effect
//! since the last drain. Every read-modify-write runs inside a
//! `BEGIN IMMEDIATE` transaction; SQLite's write lock is held for the whole
//! merge, so merges on the same entity serialise across processes, and a
//! drain reads and clears under the same lock. A merge racing a drain either
//! lands before it (and is drained) or after it (and waits for the next one).

use std::collections::BTreeMap;

use anyhow::Result;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::{
    db::{repositories::kv, Database, Namespace},
    models::{ChangeKind, LedgerEntry, PendingChange},
    utils::now_ms,
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info};

/// One entry that could not be applied, kept for manual inspection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub entry: serde_json::Value,
    pub reason: String,
    pub recorded_at: i64,
}

/// Merge `kind` into the ledger record for `entity_id` on an open
/// connection/transaction. Returns the merged record.
pub fn merge_in(conn: &Connection, entity_id: &str, kind: ChangeKind, now: i64) -> Result<LedgerEntry> {
    let key = Namespace::Ledger.key(entity_id);
    let mut entry: LedgerEntry =
        kv::get_json(conn, &key)?.unwrap_or_else(|| LedgerEntry::new(entity_id));
    entry.merge_change(kind)?;
    store_entry(conn, &key, &entry, now)?;
    Ok(entry)
}

/// `now`, or one past the pending stamped change for `entity_id` if that is
/// not older, so a new stamp always supersedes the pending one.
pub fn next_stamp_in(conn: &Connection, entity_id: &str, now: i64) -> Result<i64> {
    let pending: Option<LedgerEntry> = kv::get_json(conn, &Namespace::Ledger.key(entity_id))?;
    let stamp = pending
        .and_then(|entry| entry.state.and_then(|state| state.timestamp()))
        .map_or(now, |previous| now.max(previous + 1));
    Ok(stamp)
}

/// Fold a previously drained entry back in, preserving anything merged since.
pub fn absorb_in(conn: &Connection, entry: LedgerEntry, now: i64) -> Result<LedgerEntry> {
    let key = Namespace::Ledger.key(&entry.entity_id);
    let mut current: LedgerEntry =
        kv::get_json(conn, &key)?.unwrap_or_else(|| LedgerEntry::new(entry.entity_id.clone()));
    current.absorb(entry)?;
    store_entry(conn, &key, &current, now)?;
    Ok(current)
}

/// Read every record and clear the namespace in the caller's transaction.
/// Records that fail to parse are moved to the dead-letter namespace rather
/// than blocking every later drain.
pub fn drain_in(conn: &Connection, now: i64) -> Result<BTreeMap<String, LedgerEntry>> {
    let prefix = Namespace::Ledger.prefix();
    let rows = {
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
        rows
    };

    let mut drained = BTreeMap::new();
    for (key, raw) in rows {
        let entity_id = Namespace::Ledger
            .id_from(&key)
            .unwrap_or(key.as_str())
            .to_string();
        match serde_json::from_str::<LedgerEntry>(&raw) {
            Ok(entry) if entry.is_empty() => {}
            Ok(entry) => {
                drained.insert(entity_id, entry);
            }
            Err(err) => {
                log_error!("Unreadable ledger record {key}: {err}");
                let value = serde_json::Value::String(raw);
                append_dead_letter(conn, &entity_id, value, format!("unreadable: {err}"), now)?;
            }
        }
    }

    kv::delete_namespace(conn, Namespace::Ledger)?;
    Ok(drained)
}

/// Drop a pending `TimerTick` for `entity_id`, keeping completions.
pub fn discard_ticks_in(conn: &Connection, entity_id: &str, now: i64) -> Result<bool> {
    let key = Namespace::Ledger.key(entity_id);
    let Some(mut entry) = kv::get_json::<LedgerEntry>(conn, &key)? else {
        return Ok(false);
    };
    let discarded = entry.discard_ticks();
    if discarded {
        store_entry(conn, &key, &entry, now)?;
    }
    Ok(discarded)
}

pub fn append_dead_letter(
    conn: &Connection,
    entity_id: &str,
    entry: serde_json::Value,
    reason: String,
    now: i64,
) -> Result<()> {
    let key = Namespace::DeadLetter.key(entity_id);
    let mut records: Vec<DeadLetterRecord> = kv::get_json(conn, &key)?.unwrap_or_default();
    records.push(DeadLetterRecord {
        entry,
        reason,
        recorded_at: now,
    });
    kv::put_json(conn, &key, &records, now)
}

fn store_entry(conn: &Connection, key: &str, entry: &LedgerEntry, now: i64) -> Result<()> {
    if entry.is_empty() {
        kv::delete(conn, key)?;
    } else {
        kv::put_json(conn, key, entry, now)?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct Ledger {
    db: Database,
}

impl Ledger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn merge(&self, change: PendingChange) -> Result<LedgerEntry> {
        let PendingChange { entity_id, kind } = change;
        let label = kind.as_str();
        let id_for_log = entity_id.clone();
        let entry = self
            .db
            .write(move |tx| merge_in(tx, &entity_id, kind, now_ms()))
            .await?;
        log_debug!("Ledger merged {label} for {id_for_log}");
        Ok(entry)
    }

    /// Atomically take every pending record and clear the ledger.
    pub async fn drain_all(&self) -> Result<BTreeMap<String, LedgerEntry>> {
        let drained = self.db.write(|tx| drain_in(tx, now_ms())).await?;
        if !drained.is_empty() {
            log_info!("Ledger drained {} entr(ies)", drained.len());
        }
        Ok(drained)
    }

    pub async fn requeue(&self, entry: LedgerEntry) -> Result<LedgerEntry> {
        self.db.write(move |tx| absorb_in(tx, entry, now_ms())).await
    }

    /// Non-destructive read of everything pending.
    pub async fn pending(&self) -> Result<BTreeMap<String, LedgerEntry>> {
        let records: Vec<(String, LedgerEntry)> = self.db.list_records(Namespace::Ledger).await?;
        Ok(records.into_iter().collect())
    }

    pub async fn peek(&self, entity_id: &str) -> Result<Option<LedgerEntry>> {
        self.db.get_record(Namespace::Ledger, entity_id).await
    }

    pub async fn dead_letters(&self, entity_id: &str) -> Result<Vec<DeadLetterRecord>> {
        Ok(self
            .db
            .get_record(Namespace::DeadLetter, entity_id)
            .await?
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn ledger(tmp: &TempDir) -> Ledger {
        Ledger::new(Database::new(tmp.path().join("ledger.sqlite3")).unwrap())
    }

    fn delta(id: &str, amount: f64) -> PendingChange {
        PendingChange::new(id, ChangeKind::Delta { amount })
    }

    #[tokio::test]
    async fn second_drain_is_empty() {
        let tmp = TempDir::new().unwrap();
        let ledger = ledger(&tmp).await;
        ledger.merge(delta("goal", 1.0)).await.unwrap();
        ledger.merge(delta("goal", 1.0)).await.unwrap();

        let first = ledger.drain_all().await.unwrap();
        assert_eq!(first["goal"].net_delta(), 2.0);

        let second = ledger.drain_all().await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn set_boolean_merge_is_last_timestamp_wins() {
        let tmp = TempDir::new().unwrap();
        let ledger = ledger(&tmp).await;
        for (value, ts) in [(false, 1000), (true, 2000), (false, 1500)] {
            ledger
                .merge(PendingChange::new(
                    "habit",
                    ChangeKind::SetBoolean {
                        value,
                        timestamp: ts,
                    },
                ))
                .await
                .unwrap();
        }

        let drained = ledger.drain_all().await.unwrap();
        assert_eq!(
            drained["habit"].state,
            Some(ChangeKind::SetBoolean {
                value: true,
                timestamp: 2000
            })
        );
    }

    #[tokio::test]
    async fn interleaved_merges_and_drains_conserve_the_sum() {
        let tmp = TempDir::new().unwrap();
        let ledger = ledger(&tmp).await;

        let mut writers = Vec::new();
        for worker in 0..4 {
            let ledger = ledger.clone();
            writers.push(tokio::spawn(async move {
                let mut merged = 0.0;
                for i in 0..25 {
                    let amount = ((worker + i) % 3 + 1) as f64;
                    ledger.merge(delta("goal", amount)).await.unwrap();
                    merged += amount;
                }
                merged
            }));
        }

        let drainer = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                let mut drained = 0.0;
                for _ in 0..20 {
                    let batch = ledger.drain_all().await.unwrap();
                    drained += batch.values().map(LedgerEntry::net_delta).sum::<f64>();
                    tokio::task::yield_now().await;
                }
                drained
            })
        };

        let mut merged_total = 0.0;
        for writer in writers {
            merged_total += writer.await.unwrap();
        }
        let mut drained_total = drainer.await.unwrap();
        drained_total += ledger
            .drain_all()
            .await
            .unwrap()
            .values()
            .map(LedgerEntry::net_delta)
            .sum::<f64>();

        assert_eq!(merged_total, drained_total);
    }

    #[tokio::test]
    async fn concurrent_handles_on_one_file_do_not_lose_updates() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("shared.sqlite3");
        let first = Ledger::new(Database::new(path.clone()).unwrap());
        let second = Ledger::new(Database::new(path).unwrap());

        let (a, b) = tokio::join!(first.merge(delta("goal", 1.0)), second.merge(delta("goal", 1.0)));
        a.unwrap();
        b.unwrap();

        let drained = first.drain_all().await.unwrap();
        assert_eq!(drained["goal"].net_delta(), 2.0);
    }

    #[tokio::test]
    async fn requeue_preserves_newer_merges() {
        let tmp = TempDir::new().unwrap();
        let ledger = ledger(&tmp).await;
        ledger.merge(delta("goal", 2.0)).await.unwrap();
        let drained = ledger.drain_all().await.unwrap();

        ledger.merge(delta("goal", 1.0)).await.unwrap();
        let mut failed = drained["goal"].clone();
        failed.attempts += 1;
        ledger.requeue(failed).await.unwrap();

        let pending = ledger.peek("goal").await.unwrap().unwrap();
        assert_eq!(pending.net_delta(), 3.0);
        assert_eq!(pending.attempts, 1);
    }

    #[tokio::test]
    async fn incompatible_merge_is_rejected_without_touching_the_record() {
        let tmp = TempDir::new().unwrap();
        let ledger = ledger(&tmp).await;
        ledger.merge(delta("goal", 2.0)).await.unwrap();

        let err = ledger
            .merge(PendingChange::new(
                "goal",
                ChangeKind::SetBoolean {
                    value: true,
                    timestamp: 1,
                },
            ))
            .await;
        assert!(err.is_err());
        assert_eq!(ledger.peek("goal").await.unwrap().unwrap().net_delta(), 2.0);
    }

    #[tokio::test]
    async fn next_stamp_supersedes_the_pending_change() {
        let tmp = TempDir::new().unwrap();
        let ledger = ledger(&tmp).await;
        let next = |now| ledger.database().write(move |tx| next_stamp_in(tx, "habit", now));
        assert_eq!(next(100).await.unwrap(), 100);

        ledger
            .merge(PendingChange::new(
                "habit",
                ChangeKind::SetBoolean {
                    value: true,
                    timestamp: 100,
                },
            ))
            .await
            .unwrap();
        assert_eq!(next(100).await.unwrap(), 101);
        assert_eq!(next(250).await.unwrap(), 250);
    }

    #[tokio::test]
    async fn discarding_ticks_keeps_completions() {
        let tmp = TempDir::new().unwrap();
        let ledger = ledger(&tmp).await;
        for kind in [
            ChangeKind::TimerTick {
                elapsed_seconds: 5,
                is_running: true,
                is_countdown: false,
                timestamp: 10,
            },
            ChangeKind::TimerCompleted {
                completion_id: "c1".into(),
                elapsed_seconds: 60,
                timestamp: 5,
            },
        ] {
            ledger.merge(PendingChange::new("timer", kind)).await.unwrap();
        }

        let discarded = ledger
            .database()
            .write(|tx| discard_ticks_in(tx, "timer", 20))
            .await
            .unwrap();
        assert!(discarded);

        let entry = ledger.peek("timer").await.unwrap().unwrap();
        assert!(entry.state.is_none());
        assert_eq!(entry.completions.len(), 1);
    }

    #[tokio::test]
    async fn unreadable_records_are_dead_lettered_on_drain() {
        let tmp = TempDir::new().unwrap();
        let ledger = ledger(&tmp).await;
        ledger.merge(delta("goal", 1.0)).await.unwrap();
        ledger
            .database()
            .write(|tx| kv::put_json(tx, "ledger:broken", &"not an entry", 0))
            .await
            .unwrap();

        let drained = ledger.drain_all().await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(ledger.dead_letters("broken").await.unwrap().len(), 1);
        assert!(ledger.pending().await.unwrap().is_empty());
    }
}
