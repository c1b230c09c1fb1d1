//! Authoritative tracked entities. Only the reconciliation engine mutates
//! these once they exist; widgets only ever see copies inside snapshots.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EntityKind {
    #[serde(rename_all = "camelCase")]
    CounterGoal { numeric_value: f64, target: f64 },
    #[serde(rename_all = "camelCase")]
    HabitToggle { completed_flag: bool },
    #[serde(rename_all = "camelCase")]
    TimerHabit {
        elapsed_seconds: u64,
        is_running: bool,
        is_countdown: bool,
        target_seconds: u64,
    },
    #[serde(rename_all = "camelCase")]
    TaskItem { completed_flag: bool },
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::CounterGoal { .. } => "CounterGoal",
            EntityKind::HabitToggle { .. } => "HabitToggle",
            EntityKind::TimerHabit { .. } => "TimerHabit",
            EntityKind::TaskItem { .. } => "TaskItem",
        }
    }

    /// Whether the entity counts as "done" for status grouping.
    pub fn is_complete(&self) -> bool {
        match self {
            EntityKind::CounterGoal {
                numeric_value,
                target,
            } => *target > 0.0 && numeric_value >= target,
            EntityKind::HabitToggle { completed_flag } | EntityKind::TaskItem { completed_flag } => {
                *completed_flag
            }
            EntityKind::TimerHabit {
                elapsed_seconds,
                is_countdown,
                target_seconds,
                ..
            } => *is_countdown && *target_seconds > 0 && elapsed_seconds >= target_seconds,
        }
    }

    pub fn completed_flag(&self) -> Option<bool> {
        match self {
            EntityKind::HabitToggle { completed_flag } | EntityKind::TaskItem { completed_flag } => {
                Some(*completed_flag)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackedEntity {
    pub id: String,
    pub display_name: String,
    pub kind: EntityKind,
    /// Logical timestamp (epoch millis) of the newest change applied.
    pub updated_at: i64,
}

impl TrackedEntity {
    pub fn counter(id: &str, name: &str, value: f64, target: f64, updated_at: i64) -> Self {
        Self {
            id: id.into(),
            display_name: name.into(),
            kind: EntityKind::CounterGoal {
                numeric_value: value,
                target,
            },
            updated_at,
        }
    }

    pub fn habit(id: &str, name: &str, completed: bool, updated_at: i64) -> Self {
        Self {
            id: id.into(),
            display_name: name.into(),
            kind: EntityKind::HabitToggle {
                completed_flag: completed,
            },
            updated_at,
        }
    }

    pub fn task(id: &str, name: &str, completed: bool, updated_at: i64) -> Self {
        Self {
            id: id.into(),
            display_name: name.into(),
            kind: EntityKind::TaskItem {
                completed_flag: completed,
            },
            updated_at,
        }
    }

    pub fn timer(id: &str, name: &str, is_countdown: bool, target_seconds: u64, updated_at: i64) -> Self {
        Self {
            id: id.into(),
            display_name: name.into(),
            kind: EntityKind::TimerHabit {
                elapsed_seconds: 0,
                is_running: false,
                is_countdown,
                target_seconds,
            },
            updated_at,
        }
    }
}
