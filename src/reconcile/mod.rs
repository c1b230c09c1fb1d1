//! Reconciliation engine: drains the ledger into the authoritative store on
//! every resume and republishes the affected snapshots.

pub mod apply;
pub mod signal;

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Result;
use serde::Serialize;
use tokio::{
    sync::{Mutex, MutexGuard},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    db::{
        repositories::{completions, entities},
        Database,
    },
    error::SyncError,
    ledger::{self, Ledger},
    models::LedgerEntry,
    snapshot::SnapshotPublisher,
    utils::now_ms,
};

use apply::{apply_entry, EntryEffect};
pub use signal::{dirty_channel, DirtyReceiver, DirtySignal};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

#[derive(Debug, Default, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Entities whose stored state changed.
    pub applied: Vec<String>,
    /// Entities with at least one change dropped as older than the entity.
    pub stale: Vec<String>,
    /// Entities whose apply failed and were requeued.
    pub failed: Vec<String>,
    pub dead_lettered: Vec<String>,
    /// Drained entries that could not be written back anywhere; their content
    /// is in the error log.
    pub lost: Vec<String>,
    pub completions_recorded: usize,
    pub republished: Vec<String>,
    pub passes: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Completed(ReconcileReport),
    /// Another run was in flight; it will do one more pass for this request.
    Skipped,
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    db: Database,
    ledger: Ledger,
    publisher: SnapshotPublisher,
    lock: Arc<Mutex<()>>,
    rerun_requested: Arc<AtomicBool>,
    max_apply_attempts: u32,
}

impl ReconciliationEngine {
    pub fn new(db: Database, publisher: SnapshotPublisher, max_apply_attempts: u32) -> Self {
        Self {
            ledger: Ledger::new(db.clone()),
            db,
            publisher,
            lock: Arc::new(Mutex::new(())),
            rerun_requested: Arc::new(AtomicBool::new(false)),
            max_apply_attempts: max_apply_attempts.max(1),
        }
    }

    /// Resume-to-foreground hook.
    pub async fn on_resume(&self) -> Result<ReconcileOutcome> {
        self.reconcile().await
    }

    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        let mut report = ReconcileReport::default();
        let mut first = true;

        loop {
            let changed = {
                let Some(_guard) = self.acquire() else {
                    if first {
                        log_debug!("Reconciliation already in flight; requested a rerun");
                        return Ok(ReconcileOutcome::Skipped);
                    }
                    break;
                };
                first = false;
                self.rerun_requested.store(false, Ordering::SeqCst);
                report.passes += 1;
                self.apply_pending(&mut report).await?
            };

            // Snapshots are rebuilt after the lock is released.
            if !changed.is_empty() {
                let republished = self.publisher.republish_for(&changed).await?;
                for widget in republished {
                    if !report.republished.contains(&widget) {
                        report.republished.push(widget);
                    }
                }
            }

            if !self.rerun_requested.swap(false, Ordering::SeqCst) {
                break;
            }
        }

        if !report.applied.is_empty() || !report.failed.is_empty() || !report.dead_lettered.is_empty() {
            log_info!(
                "Reconciliation done: {} applied, {} stale, {} failed, {} dead-lettered, {} widget(s) republished",
                report.applied.len(),
                report.stale.len(),
                report.failed.len(),
                report.dead_lettered.len(),
                report.republished.len()
            );
        }
        Ok(ReconcileOutcome::Completed(report))
    }

    /// Take the run lock, or flag a rerun for whoever holds it. The holder may
    /// have checked the flag just before it was set, so the lock is tried
    /// once more after flagging.
    fn acquire(&self) -> Option<MutexGuard<'_, ()>> {
        if let Ok(guard) = self.lock.try_lock() {
            return Some(guard);
        }
        self.rerun_requested.store(true, Ordering::SeqCst);
        self.lock.try_lock().ok()
    }

    /// Drain once and apply every entry. Returns the ids whose stored state
    /// changed.
    async fn apply_pending(&self, report: &mut ReconcileReport) -> Result<BTreeSet<String>> {
        let drained = self.ledger.drain_all().await?;
        let mut changed = BTreeSet::new();
        let mut unresolved = Vec::new();

        for (entity_id, entry) in drained {
            match self.apply_one(entry.clone()).await {
                Ok(effect) => {
                    if effect.changed {
                        report.applied.push(entity_id.clone());
                        changed.insert(entity_id.clone());
                    }
                    if effect.stale > 0 {
                        log_debug!("Dropped {} stale change(s) for {}", effect.stale, entity_id);
                        report.stale.push(entity_id.clone());
                    }
                    report.completions_recorded += effect.completions.len();
                }
                Err(err) => {
                    let failure = SyncError::PartialReconciliationFailure {
                        entity_id: entity_id.clone(),
                        message: format!("{err:#}"),
                    };
                    log_warn!("{failure}");
                    if let Err(err) = self.handle_failure(entry.clone(), failure, report).await {
                        log_error!("Could not requeue or dead-letter {entity_id}: {err:#}");
                        unresolved.push(entry);
                    }
                }
            }
        }

        for entry in unresolved {
            self.restore(entry, report).await;
        }
        Ok(changed)
    }

    /// Last resort for a drained entry that could be neither requeued nor
    /// dead-lettered: merge it back unchanged, or log its full content.
    async fn restore(&self, entry: LedgerEntry, report: &mut ReconcileReport) {
        let entity_id = entry.entity_id.clone();
        match self.ledger.requeue(entry.clone()).await {
            Ok(_) => {
                log_warn!("Restored ledger entry for {entity_id} after a failed requeue");
                report.failed.push(entity_id);
            }
            Err(err) => {
                let content = serde_json::to_string(&entry).unwrap_or_else(|_| format!("{entry:?}"));
                log_error!("Ledger entry for {entity_id} could not be restored ({err:#}); entry: {content}");
                report.failed.push(entity_id.clone());
                report.lost.push(entity_id);
            }
        }
    }

    async fn apply_one(&self, entry: LedgerEntry) -> Result<EntryEffect> {
        self.db
            .write(move |tx| {
                let now = now_ms();
                let mut entity = entities::get_entity(tx, &entry.entity_id)?.ok_or_else(|| {
                    SyncError::EntityNotFound {
                        entity_id: entry.entity_id.clone(),
                    }
                })?;

                let mut effect = apply_entry(&mut entity, &entry, now)?;
                if effect.changed {
                    entities::upsert_entity(tx, &entity)?;
                }

                let mut recorded = Vec::with_capacity(effect.completions.len());
                for session in effect.completions.drain(..) {
                    if completions::insert_completion(tx, &session, now)? {
                        recorded.push(session);
                    }
                }
                effect.completions = recorded;
                Ok(effect)
            })
            .await
    }

    /// Requeue a failed entry, or dead-letter it once it has failed
    /// `max_apply_attempts` times. Entries are never dropped.
    async fn handle_failure(
        &self,
        mut entry: LedgerEntry,
        failure: SyncError,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let entity_id = entry.entity_id.clone();
        entry.attempts = entry.attempts.saturating_add(1);

        if entry.attempts < self.max_apply_attempts {
            match self.ledger.requeue(entry.clone()).await {
                Ok(_) => {
                    report.failed.push(entity_id);
                    return Ok(());
                }
                Err(err) => {
                    log_warn!("Requeue of {entity_id} failed ({err:#}); dead-lettering instead");
                }
            }
        }

        let reason = failure.to_string();
        let value = serde_json::to_value(&entry)?;
        let id = entity_id.clone();
        self.db
            .write(move |tx| ledger::append_dead_letter(tx, &id, value, reason, now_ms()))
            .await
            .map_err(|err| {
                log_error!("Could not dead-letter {entity_id}: {err:#}; entry: {entry:?}");
                err
            })?;
        log_error!("Dead-lettered ledger entry for {entity_id} after {} attempt(s)", entry.attempts);
        report.failed.push(entity_id.clone());
        report.dead_lettered.push(entity_id);
        Ok(())
    }

    /// Reconcile once per received dirty signal until cancelled or every
    /// sender is gone.
    pub fn spawn_listener(&self, mut receiver: DirtyReceiver, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        log_info!("Reconciliation listener shutting down");
                        break;
                    }
                    signal = receiver.recv() => {
                        if signal.is_none() {
                            break;
                        }
                        if let Err(err) = engine.reconcile().await {
                            log_error!("Reconciliation pass failed: {err:?}");
                        }
                    }
                }
            }
        })
    }
}
