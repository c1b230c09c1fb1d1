//! Transactional writes for one timer session. Each function runs inside the
//! caller's `BEGIN IMMEDIATE` transaction so the persisted session, its ledger
//! change and the widget's snapshot move together.

use anyhow::Result;
use rusqlite::Connection;

use crate::{
    db::{repositories::kv, Namespace},
    ledger,
    models::{ChangeKind, EntityKind, TimerSessionState},
    snapshot,
};

pub fn stored_in(conn: &Connection, widget_instance_id: &str) -> Result<Option<TimerSessionState>> {
    kv::get_json(conn, &Namespace::Timer.key(widget_instance_id))
}

/// Persist `state` without touching the ledger or the snapshot.
pub fn claim_in(conn: &Connection, state: &TimerSessionState, now: i64) -> Result<()> {
    kv::put_json(conn, &Namespace::Timer.key(&state.widget_instance_id), state, now)
}

/// Persist `state` and record it as the habit's latest `TimerTick`.
pub fn persist_in(conn: &Connection, state: &TimerSessionState, now: i64) -> Result<()> {
    claim_in(conn, state, now)?;
    ledger::merge_in(
        conn,
        &state.habit_id,
        ChangeKind::TimerTick {
            elapsed_seconds: state.elapsed_seconds,
            is_running: state.is_running,
            is_countdown: state.is_countdown,
            timestamp: now,
        },
        now,
    )?;
    show_in(conn, state, state.elapsed_seconds, state.is_running, now)
}

/// Clear the session and record its completion.
pub fn complete_in(conn: &Connection, state: &TimerSessionState, completion_id: &str, now: i64) -> Result<()> {
    kv::delete(conn, &Namespace::Timer.key(&state.widget_instance_id))?;
    ledger::merge_in(
        conn,
        &state.habit_id,
        ChangeKind::TimerCompleted {
            completion_id: completion_id.to_string(),
            elapsed_seconds: state.elapsed_seconds,
            timestamp: now,
        },
        now,
    )?;
    show_in(conn, state, 0, false, now)
}

/// Clear the session, drop its pending tick and record a terminal one.
/// Completions already in the ledger are left alone.
pub fn discard_in(conn: &Connection, state: &TimerSessionState, now: i64) -> Result<()> {
    kv::delete(conn, &Namespace::Timer.key(&state.widget_instance_id))?;
    ledger::discard_ticks_in(conn, &state.habit_id, now)?;
    ledger::merge_in(
        conn,
        &state.habit_id,
        ChangeKind::TimerTick {
            elapsed_seconds: 0,
            is_running: false,
            is_countdown: state.is_countdown,
            timestamp: now,
        },
        now,
    )?;
    show_in(conn, state, 0, false, now)
}

fn show_in(conn: &Connection, state: &TimerSessionState, elapsed: u64, running: bool, now: i64) -> Result<()> {
    snapshot::patch_entity_in(conn, &state.widget_instance_id, &state.habit_id, now, |kind| {
        if let EntityKind::TimerHabit {
            elapsed_seconds,
            is_running,
            ..
        } = kind
        {
            *elapsed_seconds = elapsed;
            *is_running = running;
        }
        Ok(())
    })?;
    Ok(())
}
