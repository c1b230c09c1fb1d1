//! Widget Mutation Handler.
//!
//! Runs in the short-lived context the host spins up for a widget tap. The
//! optimistic snapshot update and the ledger merge share one bounded
//! transaction: either both land or neither does, and the caller gets an
//! acknowledgement either way.

mod locks;

pub use locks::KeyedLocks;

use std::time::Duration;

use anyhow::Result;
use rusqlite::Connection;

use crate::{
    db::{
        repositories::{entities, kv},
        Database, Namespace,
    },
    error::{is_durable_failure, SyncError},
    ledger,
    models::{
        format_clock, format_number, Acknowledgement, ChangeKind, EntityKind, MutationRequest, Snapshot,
        WidgetMutation,
    },
    reconcile::DirtySignal,
    snapshot,
    timer::TimerSessionKeeper,
    utils::now_ms,
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_warn};

const FAILED_MESSAGE: &str = "Operation failed";

#[derive(Clone)]
pub struct WidgetMutationHandler {
    db: Database,
    keeper: TimerSessionKeeper,
    locks: KeyedLocks,
    signal: Option<DirtySignal>,
    write_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
struct Planned {
    next: EntityKind,
    change: Option<ChangeKind>,
    message: String,
}

impl WidgetMutationHandler {
    pub fn new(db: Database, keeper: TimerSessionKeeper, write_timeout: Duration) -> Self {
        Self {
            db,
            keeper,
            locks: KeyedLocks::new(),
            signal: None,
            write_timeout,
        }
    }

    pub fn with_signal(mut self, signal: DirtySignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub async fn handle(&self, request: MutationRequest) -> Acknowledgement {
        let mutation = match WidgetMutation::from_request(&request) {
            Ok(mutation) => mutation,
            Err(err) => {
                log_warn!("Rejected widget request {:?}: {err}", request.mutation_kind);
                return Acknowledgement::failed(user_message(&err));
            }
        };

        let _guard = self.locks.lock(&request.entity_id).await;
        let result = if mutation.is_timer() {
            self.apply_timer(&request, mutation).await
        } else {
            self.apply_value(&request, mutation).await
        };

        match result {
            Ok(message) => {
                self.notify();
                Acknowledgement::ok(message)
            }
            Err(err) => {
                let message = match err.downcast_ref::<SyncError>() {
                    Some(sync_err) if !is_durable_failure(&err) => user_message(sync_err),
                    _ => FAILED_MESSAGE.to_string(),
                };
                log_error!(
                    "Widget {} mutation {} on {} failed: {err:?}",
                    request.widget_instance_id,
                    request.mutation_kind,
                    request.entity_id
                );
                Acknowledgement::failed(message)
            }
        }
    }

    async fn apply_value(&self, request: &MutationRequest, mutation: WidgetMutation) -> Result<String> {
        let entity_id = request.entity_id.clone();
        let widget_instance_id = request.widget_instance_id.clone();
        let message = self
            .db
            .write_with_deadline(self.write_timeout, move |tx| {
                apply_in(tx, &widget_instance_id, &entity_id, mutation, now_ms())
            })
            .await?;
        log_debug!("Widget {} applied {}", request.widget_instance_id, message);
        Ok(message)
    }

    async fn apply_timer(&self, request: &MutationRequest, mutation: WidgetMutation) -> Result<String> {
        let widget_instance_id = request.widget_instance_id.as_str();
        if mutation != WidgetMutation::TimerStart {
            if let Some(active) = self.keeper.status(widget_instance_id).await {
                if active.habit_id != request.entity_id {
                    return Err(SyncError::InvalidMutation(format!(
                        "widget {widget_instance_id} is timing {}",
                        active.habit_id
                    ))
                    .into());
                }
            }
        }

        let message = match mutation {
            WidgetMutation::TimerStart => {
                self.keeper.start(widget_instance_id, &request.entity_id).await?;
                "Timer started".to_string()
            }
            WidgetMutation::TimerPause => {
                self.keeper.pause(widget_instance_id).await?;
                "Timer paused".to_string()
            }
            WidgetMutation::TimerStop => {
                self.keeper.stop(widget_instance_id).await?;
                "Timer stopped".to_string()
            }
            WidgetMutation::TimerComplete => {
                let completed = self.keeper.complete(widget_instance_id).await?;
                let name = self
                    .db
                    .get_entity(&completed.habit_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|entity| entity.display_name)
                    .unwrap_or_else(|| "Timer".to_string());
                format!("{name} completed ({})", format_clock(completed.elapsed_seconds))
            }
            other => {
                return Err(SyncError::InvalidMutation(format!("{other:?} is not a timer mutation")).into())
            }
        };
        Ok(message)
    }

    fn notify(&self) {
        if let Some(signal) = &self.signal {
            signal.notify();
        }
    }
}

/// Read the last known value, write the optimistic snapshot and merge the
/// ledger, all on the caller's transaction.
fn apply_in(
    conn: &Connection,
    widget_instance_id: &str,
    entity_id: &str,
    mutation: WidgetMutation,
    now: i64,
) -> Result<String> {
    let (display_name, kind) = last_known(conn, widget_instance_id, entity_id)?;
    let now = ledger::next_stamp_in(conn, entity_id, now)?;
    let planned = plan(&display_name, &kind, mutation, now)?;

    let next = planned.next.clone();
    snapshot::patch_entity_in(conn, widget_instance_id, entity_id, now, move |kind| {
        *kind = next;
        Ok(())
    })?;

    if let Some(change) = planned.change {
        ledger::merge_in(conn, entity_id, change, now)?;
    }
    Ok(planned.message)
}

/// The widget's own snapshot first; the authoritative row when the widget
/// does not show the entity (yet).
fn last_known(conn: &Connection, widget_instance_id: &str, entity_id: &str) -> Result<(String, EntityKind)> {
    let snapshot: Option<Snapshot> = kv::get_json(conn, &Namespace::Snapshot.key(widget_instance_id))?;
    if let Some(view) = snapshot.as_ref().and_then(|snapshot| snapshot.entity(entity_id)) {
        return Ok((view.display_name.clone(), view.kind.clone()));
    }

    let entity = entities::get_entity(conn, entity_id)?.ok_or_else(|| SyncError::EntityNotFound {
        entity_id: entity_id.to_string(),
    })?;
    Ok((entity.display_name, entity.kind))
}

fn plan(name: &str, kind: &EntityKind, mutation: WidgetMutation, now: i64) -> Result<Planned, SyncError> {
    let planned = match (mutation, kind) {
        (WidgetMutation::Increment { amount }, EntityKind::CounterGoal { numeric_value, target }) => Planned {
            next: EntityKind::CounterGoal {
                numeric_value: numeric_value + amount,
                target: *target,
            },
            change: Some(ChangeKind::Delta { amount }),
            message: format!("{name} +{}", format_number(amount)),
        },
        (WidgetMutation::Decrement { amount }, EntityKind::CounterGoal { numeric_value, target }) => {
            let next_value = (numeric_value - amount).max(0.0);
            let applied = next_value - numeric_value;
            Planned {
                next: EntityKind::CounterGoal {
                    numeric_value: next_value,
                    target: *target,
                },
                change: (applied != 0.0).then_some(ChangeKind::Delta { amount: applied }),
                message: format!("{name} -{}", format_number(-applied)),
            }
        }
        (
            WidgetMutation::Toggle | WidgetMutation::SetCompleted { .. },
            EntityKind::HabitToggle { completed_flag } | EntityKind::TaskItem { completed_flag },
        ) => {
            let value = match mutation {
                WidgetMutation::SetCompleted { value } => value,
                _ => !completed_flag,
            };
            let next = match kind {
                EntityKind::TaskItem { .. } => EntityKind::TaskItem { completed_flag: value },
                _ => EntityKind::HabitToggle { completed_flag: value },
            };
            let verb = if value { "done" } else { "reopened" };
            Planned {
                next,
                change: Some(ChangeKind::SetBoolean { value, timestamp: now }),
                message: format!("{name} {verb}"),
            }
        }
        (mutation, kind) => {
            return Err(SyncError::InvalidMutation(format!(
                "{mutation:?} does not apply to a {}",
                kind.as_str()
            )))
        }
    };
    Ok(planned)
}

fn user_message(err: &SyncError) -> String {
    match err {
        SyncError::InvalidMutation(message) => message.clone(),
        SyncError::DurableWriteFailure { .. } | SyncError::WriteTimeout { .. } => FAILED_MESSAGE.to_string(),
        other => other.to_string(),
    }
}
