//! Per-kind apply rules for one drained ledger entry.

use crate::{
    error::SyncError,
    models::{ChangeKind, CompletedSession, EntityKind, LedgerEntry, TrackedEntity},
};

const ENABLE_LOGS: bool = true;

use crate::log_debug;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct EntryEffect {
    /// Whether the entity itself changed and must be persisted.
    pub changed: bool,
    /// Stamped changes dropped because the entity was already newer.
    pub stale: usize,
    pub completions: Vec<CompletedSession>,
}

enum Stamped<'a> {
    State(&'a ChangeKind),
    Completion(&'a crate::models::TimerCompletion),
}

pub fn apply_entry(entity: &mut TrackedEntity, entry: &LedgerEntry, now: i64) -> Result<EntryEffect, SyncError> {
    let mut effect = EntryEffect::default();
    let mut stamped: Vec<(i64, Stamped<'_>)> = Vec::new();

    match &entry.state {
        None => {}
        Some(ChangeKind::Delta { amount }) => apply_delta(entity, *amount, now, &mut effect)?,
        Some(state) => stamped.push((state.timestamp().unwrap_or(0), Stamped::State(state))),
    }
    for completion in &entry.completions {
        stamped.push((completion.timestamp, Stamped::Completion(completion)));
    }

    // Oldest first, so a tick from a session started after a completion
    // still wins over that completion's reset.
    stamped.sort_by_key(|(timestamp, _)| *timestamp);

    for (timestamp, item) in stamped {
        match item {
            Stamped::State(state) => apply_state(entity, state, timestamp, &mut effect)?,
            Stamped::Completion(completion) => {
                if !matches!(entity.kind, EntityKind::TimerHabit { .. }) {
                    return Err(mismatch(entity, "timerCompleted"));
                }

                effect.completions.push(CompletedSession {
                    completion_id: completion.completion_id.clone(),
                    entity_id: entity.id.clone(),
                    elapsed_seconds: completion.elapsed_seconds,
                    completed_at: completion.timestamp,
                });

                if timestamp > entity.updated_at {
                    if let EntityKind::TimerHabit {
                        elapsed_seconds,
                        is_running,
                        ..
                    } = &mut entity.kind
                    {
                        *elapsed_seconds = 0;
                        *is_running = false;
                    }
                    entity.updated_at = timestamp;
                    effect.changed = true;
                }
            }
        }
    }

    Ok(effect)
}

fn apply_delta(entity: &mut TrackedEntity, amount: f64, now: i64, effect: &mut EntryEffect) -> Result<(), SyncError> {
    if !matches!(entity.kind, EntityKind::CounterGoal { .. }) {
        return Err(mismatch(entity, "delta"));
    }
    if amount == 0.0 {
        return Ok(());
    }
    if let EntityKind::CounterGoal { numeric_value, .. } = &mut entity.kind {
        *numeric_value = (*numeric_value + amount).max(0.0);
    }
    entity.updated_at = entity.updated_at.max(now);
    effect.changed = true;
    Ok(())
}

fn apply_state(
    entity: &mut TrackedEntity,
    state: &ChangeKind,
    timestamp: i64,
    effect: &mut EntryEffect,
) -> Result<(), SyncError> {
    let is_newer = timestamp > entity.updated_at;
    let entity_id = entity.id.clone();
    let existing = entity.kind.as_str();
    match (state, &mut entity.kind) {
        (
            ChangeKind::SetBoolean { value, .. },
            EntityKind::HabitToggle { completed_flag } | EntityKind::TaskItem { completed_flag },
        ) => {
            if is_newer {
                *completed_flag = *value;
            }
        }
        (
            ChangeKind::TimerTick {
                elapsed_seconds: tick_elapsed,
                is_running: tick_running,
                is_countdown: tick_countdown,
                ..
            },
            EntityKind::TimerHabit {
                elapsed_seconds,
                is_running,
                is_countdown,
                ..
            },
        ) => {
            if is_newer {
                *elapsed_seconds = *tick_elapsed;
                *is_running = *tick_running;
                *is_countdown = *tick_countdown;
            }
        }
        (state, _) => {
            return Err(SyncError::IncompatibleChange {
                entity_id,
                existing,
                incoming: state.as_str(),
            })
        }
    }

    if is_newer {
        entity.updated_at = timestamp;
        effect.changed = true;
    } else {
        let conflict = SyncError::StaleApplyConflict {
            entity_id: entity.id.clone(),
            change_ts: timestamp,
            entity_ts: entity.updated_at,
        };
        log_debug!("Dropping {}: {conflict}", state.as_str());
        effect.stale += 1;
    }
    Ok(())
}

fn mismatch(entity: &TrackedEntity, incoming: &'static str) -> SyncError {
    SyncError::IncompatibleChange {
        entity_id: entity.id.clone(),
        existing: entity.kind.as_str(),
        incoming,
    }
}
