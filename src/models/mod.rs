pub mod change;
pub mod entity;
pub mod snapshot;
pub mod timer;
pub mod widget;

pub use change::{ChangeKind, LedgerEntry, PendingChange, TimerCompletion};
pub use entity::{EntityKind, TrackedEntity};
pub use snapshot::{format_number, Grouping, RenderConfig, Snapshot, SnapshotEntity, WidgetBinding};
pub use timer::{format_clock, TimerEvent, TimerSessionState, TimerStatus};
pub use widget::{Acknowledgement, MutationRequest, WidgetMutation};

use serde::{Deserialize, Serialize};

/// Record appended when a timer session completes. `completion_id` is unique,
/// which keeps re-applied completions from duplicating.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletedSession {
    pub completion_id: String,
    pub entity_id: String,
    pub elapsed_seconds: u64,
    pub completed_at: i64,
}
