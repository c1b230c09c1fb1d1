//! Pending changes and the per-entity ledger record they merge into.
//!
//! A ledger record is the net effect of everything recorded for one entity
//! since the last successful reconciliation:
//!
//! - `Delta` changes sum (commutative).
//! - `SetBoolean` and `TimerTick` replace the held state only when strictly
//!   newer (last timestamp wins).
//! - Timer completions are kept in their own list, unique by completion id,
//!   so a later tick can never overwrite one.

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChangeKind {
    Delta {
        amount: f64,
    },
    SetBoolean {
        value: bool,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    TimerTick {
        elapsed_seconds: u64,
        is_running: bool,
        is_countdown: bool,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    TimerCompleted {
        completion_id: String,
        elapsed_seconds: u64,
        timestamp: i64,
    },
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Delta { .. } => "delta",
            ChangeKind::SetBoolean { .. } => "setBoolean",
            ChangeKind::TimerTick { .. } => "timerTick",
            ChangeKind::TimerCompleted { .. } => "timerCompleted",
        }
    }

    pub fn timestamp(&self) -> Option<i64> {
        match self {
            ChangeKind::Delta { .. } => None,
            ChangeKind::SetBoolean { timestamp, .. }
            | ChangeKind::TimerTick { timestamp, .. }
            | ChangeKind::TimerCompleted { timestamp, .. } => Some(*timestamp),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    pub entity_id: String,
    pub kind: ChangeKind,
}

impl PendingChange {
    pub fn new(entity_id: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            entity_id: entity_id.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TimerCompletion {
    pub completion_id: String,
    pub elapsed_seconds: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub entity_id: String,
    /// Net `Delta`, or the newest `SetBoolean`/`TimerTick`. Never a completion.
    #[serde(default)]
    pub state: Option<ChangeKind>,
    #[serde(default)]
    pub completions: Vec<TimerCompletion>,
    /// Failed reconciliation attempts carried across requeues.
    #[serde(default)]
    pub attempts: u32,
}

impl LedgerEntry {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: None,
            completions: Vec::new(),
            attempts: 0,
        }
    }

    /// True when applying the entry would change nothing.
    pub fn is_empty(&self) -> bool {
        let state_is_noop = match &self.state {
            None => true,
            Some(ChangeKind::Delta { amount }) => *amount == 0.0,
            Some(_) => false,
        };
        state_is_noop && self.completions.is_empty()
    }

    pub fn net_delta(&self) -> f64 {
        match &self.state {
            Some(ChangeKind::Delta { amount }) => *amount,
            _ => 0.0,
        }
    }

    pub fn merge_change(&mut self, incoming: ChangeKind) -> Result<(), SyncError> {
        let incoming = match incoming {
            ChangeKind::TimerCompleted {
                completion_id,
                elapsed_seconds,
                timestamp,
            } => {
                if !self
                    .completions
                    .iter()
                    .any(|existing| existing.completion_id == completion_id)
                {
                    self.completions.push(TimerCompletion {
                        completion_id,
                        elapsed_seconds,
                        timestamp,
                    });
                }
                return Ok(());
            }
            other => other,
        };

        let merged = match self.state.take() {
            None => incoming,
            Some(existing) => match merge_state(&self.entity_id, existing.clone(), incoming) {
                Ok(merged) => merged,
                Err(err) => {
                    self.state = Some(existing);
                    return Err(err);
                }
            },
        };
        self.state = Some(merged);
        Ok(())
    }

    /// Fold an older entry (typically one being requeued after a failed
    /// apply) into this one. Newer stamped state survives, deltas add up and
    /// completions are unioned.
    pub fn absorb(&mut self, other: LedgerEntry) -> Result<(), SyncError> {
        if let Some(state) = other.state {
            self.merge_change(state)?;
        }
        for completion in other.completions {
            self.merge_change(ChangeKind::TimerCompleted {
                completion_id: completion.completion_id,
                elapsed_seconds: completion.elapsed_seconds,
                timestamp: completion.timestamp,
            })?;
        }
        self.attempts = self.attempts.max(other.attempts);
        Ok(())
    }

    /// Drop a pending `TimerTick`, keeping deltas and completions.
    pub fn discard_ticks(&mut self) -> bool {
        if matches!(self.state, Some(ChangeKind::TimerTick { .. })) {
            self.state = None;
            return true;
        }
        false
    }
}

fn merge_state(entity_id: &str, existing: ChangeKind, incoming: ChangeKind) -> Result<ChangeKind, SyncError> {
    match (existing, incoming) {
        (ChangeKind::Delta { amount: a }, ChangeKind::Delta { amount: b }) => {
            Ok(ChangeKind::Delta { amount: a + b })
        }
        (existing @ ChangeKind::SetBoolean { .. }, incoming @ ChangeKind::SetBoolean { .. })
        | (existing @ ChangeKind::TimerTick { .. }, incoming @ ChangeKind::TimerTick { .. }) => {
            if incoming.timestamp() > existing.timestamp() {
                Ok(incoming)
            } else {
                Ok(existing)
            }
        }
        (existing, incoming) => Err(SyncError::IncompatibleChange {
            entity_id: entity_id.to_string(),
            existing: existing.as_str(),
            incoming: incoming.as_str(),
        }),
    }
}
