use serde::{Deserialize, Serialize};

use super::{
    entity::{EntityKind, TrackedEntity},
    timer::format_clock,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum Grouping {
    /// Keep the order the widget was configured with.
    #[default]
    None,
    ByKind,
    /// Incomplete entries first.
    ByStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RenderConfig {
    pub accent_color: String,
    pub background_color: String,
    pub grouping: Grouping,
    pub show_progress: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            accent_color: "#4CAF50".into(),
            background_color: "#FFFFFF".into(),
            grouping: Grouping::None,
            show_progress: true,
        }
    }
}

/// Read-only copy of one entity as the widget renders it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntity {
    pub id: String,
    pub display_name: String,
    pub kind: EntityKind,
    pub label: String,
    /// 0.0..=1.0 for entities with a target.
    pub progress: Option<f64>,
}

impl SnapshotEntity {
    pub fn from_entity(entity: &TrackedEntity) -> Self {
        let mut view = Self {
            id: entity.id.clone(),
            display_name: entity.display_name.clone(),
            kind: entity.kind.clone(),
            label: String::new(),
            progress: None,
        };
        view.refresh();
        view
    }

    /// Recompute `label`/`progress` after `kind` changed.
    pub fn refresh(&mut self) {
        let (label, progress) = describe(&self.kind);
        self.label = label;
        self.progress = progress;
    }
}

fn describe(kind: &EntityKind) -> (String, Option<f64>) {
    match kind {
        EntityKind::CounterGoal {
            numeric_value,
            target,
        } => {
            let ratio = if *target > 0.0 {
                (numeric_value / target).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let pct = (ratio * 100.0).floor() as u32;
            (
                format!("{}/{} ({}%)", format_number(*numeric_value), format_number(*target), pct),
                Some(ratio),
            )
        }
        EntityKind::HabitToggle { completed_flag } | EntityKind::TaskItem { completed_flag } => {
            let label = if *completed_flag { "Done" } else { "Open" };
            (label.to_string(), None)
        }
        EntityKind::TimerHabit {
            elapsed_seconds,
            is_countdown,
            target_seconds,
            ..
        } => {
            if *is_countdown {
                let remaining = target_seconds.saturating_sub(*elapsed_seconds);
                let progress = if *target_seconds > 0 {
                    Some((*elapsed_seconds as f64 / *target_seconds as f64).min(1.0))
                } else {
                    None
                };
                (format_clock(remaining), progress)
            } else {
                (format_clock(*elapsed_seconds), None)
            }
        }
    }
}

pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value:.1}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub widget_instance_id: String,
    pub version: u64,
    pub generated_at: i64,
    pub config: RenderConfig,
    pub entities: Vec<SnapshotEntity>,
}

impl Snapshot {
    pub fn entity(&self, entity_id: &str) -> Option<&SnapshotEntity> {
        self.entities.iter().find(|entity| entity.id == entity_id)
    }

    pub fn entity_mut(&mut self, entity_id: &str) -> Option<&mut SnapshotEntity> {
        self.entities.iter_mut().find(|entity| entity.id == entity_id)
    }
}

/// Which entities a placed widget shows and how it renders them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WidgetBinding {
    pub widget_instance_id: String,
    pub entity_ids: Vec<String>,
    #[serde(default)]
    pub config: RenderConfig,
}

impl WidgetBinding {
    pub fn shows_any<'a>(&self, entity_ids: impl IntoIterator<Item = &'a String>) -> bool {
        entity_ids
            .into_iter()
            .any(|id| self.entity_ids.iter().any(|bound| bound == id))
    }
}
