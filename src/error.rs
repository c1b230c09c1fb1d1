//! Failure taxonomy for the widget sync subsystem.
//!
//! Nothing here is fatal to the application. Internal plumbing returns
//! `anyhow::Result`; the variants below are raised through `anyhow` and
//! recovered with `downcast_ref` where a caller has to tell them apart.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Storage unavailable, full, or the transaction failed to commit.
    #[error("durable write failed: {message}")]
    DurableWriteFailure { message: String },

    /// The bounded durable write did not finish before its deadline.
    #[error("durable write timed out after {timeout_ms}ms")]
    WriteTimeout { timeout_ms: u64 },

    /// A stamped change older than the entity it targets.
    #[error("stale change for {entity_id}: change at {change_ts}, entity at {entity_ts}")]
    StaleApplyConflict {
        entity_id: String,
        change_ts: i64,
        entity_ts: i64,
    },

    #[error("orphaned timer session on widget {widget_instance_id} ({gap_secs}s since last tick)")]
    OrphanedTimerSession {
        widget_instance_id: String,
        gap_secs: i64,
    },

    #[error("reconciliation failed for {entity_id}: {message}")]
    PartialReconciliationFailure { entity_id: String, message: String },

    #[error("change {incoming} cannot merge into pending {existing} for {entity_id}")]
    IncompatibleChange {
        entity_id: String,
        existing: &'static str,
        incoming: &'static str,
    },

    #[error("entity {entity_id} not found")]
    EntityNotFound { entity_id: String },

    #[error("invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("invalid timer transition: {from} --{event}-->")]
    InvalidTransition {
        from: &'static str,
        event: &'static str,
    },
}

impl SyncError {
    pub fn durable(err: impl std::fmt::Display) -> Self {
        SyncError::DurableWriteFailure {
            message: err.to_string(),
        }
    }
}

/// True when `err` carries a [`SyncError::WriteTimeout`] or
/// [`SyncError::DurableWriteFailure`] anywhere in its chain.
pub fn is_durable_failure(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<SyncError>(),
            Some(SyncError::WriteTimeout { .. }) | Some(SyncError::DurableWriteFailure { .. })
        )
    })
}
