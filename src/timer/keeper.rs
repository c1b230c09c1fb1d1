//! Timer Session Keeper.
//!
//! Owns every active timer of this process in an arena keyed by widget
//! instance id. A running timer has its own tick task; each tick adds one
//! second, persists `timer:<widgetInstanceId>` and merges a `TimerTick` into
//! the ledger in a single transaction, so a killed process loses at most the
//! tick in flight.
//!
//! Several surfaces may run a keeper over the same store. The persisted
//! session names the keeper that owns it, and a tick only lands while the
//! stored session is still running under that owner. Any other keeper's
//! pause, stop or complete therefore ends the owner's tick loop at its next
//! tick.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use serde::Serialize;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    db::{Database, Namespace},
    error::SyncError,
    models::{EntityKind, TimerEvent, TimerSessionState, TimerStatus},
    reconcile::DirtySignal,
    settings::SyncSettings,
    utils::now_ms,
};

use super::persist;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

#[derive(Debug, Clone)]
pub struct KeeperOptions {
    pub tick_interval: Duration,
    /// Bound for writes triggered by a user action (start/pause/stop/complete).
    pub write_timeout: Duration,
    pub orphan_resume_threshold_ms: i64,
    /// A running session ticked more recently than this is left to the
    /// keeper that owns it.
    pub ownership_lease: Duration,
}

impl Default for KeeperOptions {
    fn default() -> Self {
        KeeperOptions::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for KeeperOptions {
    fn from(settings: &SyncSettings) -> Self {
        Self {
            tick_interval: settings.tick_interval(),
            write_timeout: settings.write_timeout(),
            orphan_resume_threshold_ms: settings.orphan_resume_threshold_ms(),
            ownership_lease: settings.ownership_lease(),
        }
    }
}

/// Result of an explicit or automatic completion.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletedTimer {
    pub habit_id: String,
    pub widget_instance_id: String,
    pub completion_id: String,
    pub elapsed_seconds: u64,
    pub completed_at: i64,
}

#[derive(Debug, Default, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// Running sessions picked up again within the resume threshold.
    pub resumed: Vec<String>,
    /// Running sessions whose gap was too long; now paused.
    pub paused: Vec<String>,
    /// Sessions that were already paused.
    pub reloaded: Vec<String>,
    /// Running sessions another live keeper is still ticking. They are
    /// watched and recovered once that keeper goes quiet.
    pub held: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovered {
    Resumed,
    Paused,
    Reloaded,
    Held,
}

struct ActiveTimer {
    state: TimerSessionState,
    cancel: CancellationToken,
    ticker: Option<JoinHandle<()>>,
}

impl ActiveTimer {
    fn idle(state: TimerSessionState) -> Self {
        Self {
            state,
            cancel: CancellationToken::new(),
            ticker: None,
        }
    }

    fn is_ticking(&self) -> bool {
        self.state.is_running && !self.cancel.is_cancelled()
    }

    fn halt(&mut self) {
        self.cancel.cancel();
        self.ticker.take();
    }
}

enum TickOutcome {
    Continue,
    Finished,
}

enum TickWrite {
    Persisted,
    /// The stored session was paused, removed or claimed by another keeper.
    Lost(Option<TimerSessionState>),
}

type Arena = HashMap<String, ActiveTimer>;

#[derive(Clone)]
pub struct TimerSessionKeeper {
    db: Database,
    arena: Arc<Mutex<Arena>>,
    options: KeeperOptions,
    signal: Option<DirtySignal>,
    owner: String,
    closing: CancellationToken,
}

impl TimerSessionKeeper {
    pub fn new(db: Database, options: KeeperOptions) -> Self {
        Self {
            db,
            arena: Arc::new(Mutex::new(HashMap::new())),
            options,
            signal: None,
            owner: Uuid::new_v4().to_string(),
            closing: CancellationToken::new(),
        }
    }

    pub fn with_signal(mut self, signal: DirtySignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Id written into the sessions this keeper runs.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub async fn status(&self, widget_instance_id: &str) -> Option<TimerSessionState> {
        let arena = self.arena.lock().await;
        arena.get(widget_instance_id).map(|active| active.state.clone())
    }

    pub async fn active_sessions(&self) -> Vec<TimerSessionState> {
        let arena = self.arena.lock().await;
        let mut sessions: Vec<_> = arena.values().map(|active| active.state.clone()).collect();
        sessions.sort_by(|a, b| a.widget_instance_id.cmp(&b.widget_instance_id));
        sessions
    }

    /// Start a new session, or resume the paused one on this widget. The
    /// persisted session is re-read inside the write, so a session another
    /// surface paused is resumed from its latest elapsed time.
    pub async fn start(&self, widget_instance_id: &str, habit_id: &str) -> Result<TimerSessionState> {
        let entity = self
            .db
            .get_entity(habit_id)
            .await?
            .ok_or_else(|| SyncError::EntityNotFound {
                entity_id: habit_id.to_string(),
            })?;
        let EntityKind::TimerHabit {
            is_countdown,
            target_seconds,
            ..
        } = entity.kind
        else {
            return Err(SyncError::InvalidMutation(format!("{habit_id} is not a timer habit")).into());
        };

        let mut arena = self.arena.lock().await;
        let fresh = TimerSessionState {
            habit_id: habit_id.to_string(),
            widget_instance_id: widget_instance_id.to_string(),
            elapsed_seconds: 0,
            is_running: false,
            is_countdown,
            target_seconds,
            last_tick_at: 0,
            owner: self.owner.clone(),
        };
        let owner = self.owner.clone();
        let state = self
            .db
            .write_with_deadline(self.options.write_timeout, move |tx| {
                let mut state = match persist::stored_in(tx, &fresh.widget_instance_id)? {
                    Some(current) if current.habit_id != fresh.habit_id => {
                        return Err(SyncError::InvalidMutation(format!(
                            "widget {} already has a timer for {}",
                            fresh.widget_instance_id, current.habit_id
                        ))
                        .into());
                    }
                    Some(current) => {
                        current.status().transition(TimerEvent::Start)?;
                        current
                    }
                    None => {
                        TimerStatus::Idle.transition(TimerEvent::Start)?;
                        fresh
                    }
                };
                let now = stamp_after(Some(state.last_tick_at));
                state.is_running = true;
                state.owner = owner;
                state.last_tick_at = now;
                persist::persist_in(tx, &state, now)?;
                Ok(state)
            })
            .await?;

        let cancel = CancellationToken::new();
        let ticker = self.spawn_ticker(widget_instance_id.to_string(), cancel.clone());
        let started = ActiveTimer {
            state: state.clone(),
            cancel,
            ticker: Some(ticker),
        };
        if let Some(mut previous) = arena.insert(widget_instance_id.to_string(), started) {
            previous.halt();
        }

        log_info!(
            "Timer for {} started on widget {} at {}s",
            habit_id,
            widget_instance_id,
            state.elapsed_seconds
        );
        Ok(state)
    }

    pub async fn pause(&self, widget_instance_id: &str) -> Result<TimerSessionState> {
        let mut arena = self.arena.lock().await;
        let id = widget_instance_id.to_string();
        let owner = self.owner.clone();
        let paused = self
            .db
            .write_with_deadline(self.options.write_timeout, move |tx| {
                let mut state = persist::stored_in(tx, &id)?.ok_or_else(|| from_idle(TimerEvent::Pause))?;
                state.status().transition(TimerEvent::Pause)?;
                let now = stamp_after(Some(state.last_tick_at));
                state.is_running = false;
                state.owner = owner;
                state.last_tick_at = now;
                persist::persist_in(tx, &state, now)?;
                Ok(state)
            })
            .await?;

        if let Some(mut previous) = arena.insert(widget_instance_id.to_string(), ActiveTimer::idle(paused.clone())) {
            previous.halt();
        }
        drop(arena);

        log_info!(
            "Timer on widget {} paused at {}s",
            widget_instance_id,
            paused.elapsed_seconds
        );
        self.notify();
        Ok(paused)
    }

    /// Discard the session. Returns `None` when nothing was active.
    pub async fn stop(&self, widget_instance_id: &str) -> Result<Option<TimerSessionState>> {
        let mut arena = self.arena.lock().await;
        let id = widget_instance_id.to_string();
        let stopped = self
            .db
            .write_with_deadline(self.options.write_timeout, move |tx| {
                let Some(state) = persist::stored_in(tx, &id)? else {
                    return Ok(None);
                };
                state.status().transition(TimerEvent::Stop)?;
                let now = stamp_after(Some(state.last_tick_at));
                persist::discard_in(tx, &state, now)?;
                Ok(Some(state))
            })
            .await?;

        if let Some(mut active) = arena.remove(widget_instance_id) {
            active.halt();
        }
        drop(arena);

        let Some(stopped) = stopped else {
            return Ok(None);
        };
        log_info!(
            "Timer for {} on widget {} stopped at {}s (discarded)",
            stopped.habit_id,
            widget_instance_id,
            stopped.elapsed_seconds
        );
        self.notify();
        Ok(Some(stopped))
    }

    /// Commit the session as completed with its current elapsed time.
    pub async fn complete(&self, widget_instance_id: &str) -> Result<CompletedTimer> {
        let mut arena = self.arena.lock().await;
        let id = widget_instance_id.to_string();
        let completion_id = Uuid::new_v4().to_string();
        let cid = completion_id.clone();
        let (state, now) = self
            .db
            .write_with_deadline(self.options.write_timeout, move |tx| {
                let mut state = persist::stored_in(tx, &id)?.ok_or_else(|| from_idle(TimerEvent::Complete))?;
                state.status().transition(TimerEvent::Complete)?;
                let now = stamp_after(Some(state.last_tick_at));
                state.is_running = false;
                persist::complete_in(tx, &state, &cid, now)?;
                Ok((state, now))
            })
            .await?;

        if let Some(mut active) = arena.remove(widget_instance_id) {
            active.halt();
        }
        drop(arena);

        self.notify();
        Ok(completed_timer(state, completion_id, now))
    }

    /// Bring persisted sessions back after a restart. Running sessions whose
    /// last tick is recent resume; older ones are paused at their persisted
    /// elapsed time. Sessions another live keeper is ticking are left alone
    /// and watched. Elapsed time is never reset here.
    pub async fn recover_orphans(&self, now: i64) -> Result<RecoveryReport> {
        let records: Vec<(String, TimerSessionState)> = self.db.list_records(Namespace::Timer).await?;
        let mut report = RecoveryReport::default();
        let mut arena = self.arena.lock().await;

        for (widget_instance_id, state) in records {
            if arena.get(&widget_instance_id).is_some_and(ActiveTimer::is_ticking) {
                continue;
            }
            match self.recover_one(&mut arena, &widget_instance_id, state, now).await? {
                Recovered::Resumed => report.resumed.push(widget_instance_id),
                Recovered::Paused => report.paused.push(widget_instance_id),
                Recovered::Reloaded => report.reloaded.push(widget_instance_id),
                Recovered::Held => {
                    self.watch_held(widget_instance_id.clone());
                    report.held.push(widget_instance_id);
                }
            }
        }
        drop(arena);

        if !report.paused.is_empty() {
            self.notify();
        }
        Ok(report)
    }

    /// Cancel every tick loop and recovery watch. Persisted state is left
    /// as-is so the next start can recover it.
    pub async fn shutdown(&self) {
        self.closing.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut arena = self.arena.lock().await;
            arena
                .drain()
                .filter_map(|(_, mut active)| {
                    active.cancel.cancel();
                    active.ticker.take()
                })
                .collect()
        };

        for handle in handles {
            if let Err(err) = handle.await {
                log_warn!("Timer tick task ended abnormally: {err}");
            }
        }
        log_info!("Timer keeper shut down");
    }

    async fn recover_one(
        &self,
        arena: &mut Arena,
        widget_instance_id: &str,
        state: TimerSessionState,
        now: i64,
    ) -> Result<Recovered> {
        if !state.is_running {
            if let Some(mut previous) = arena.insert(widget_instance_id.to_string(), ActiveTimer::idle(state)) {
                previous.halt();
            }
            return Ok(Recovered::Reloaded);
        }

        let gap_ms = (now - state.last_tick_at).max(0);
        let lease_ms = i64::try_from(self.options.ownership_lease.as_millis()).unwrap_or(i64::MAX);
        if state.owner != self.owner && gap_ms < lease_ms {
            log_debug!(
                "Timer on widget {widget_instance_id} is held by keeper {} ({gap_ms}ms since last tick)",
                state.owner
            );
            return Ok(Recovered::Held);
        }

        let resume = gap_ms <= self.options.orphan_resume_threshold_ms;
        let mut claimed = state.clone();
        claimed.owner = self.owner.clone();
        if !resume {
            claimed.is_running = false;
            claimed.last_tick_at = now;
        }

        let expected = state;
        let record = claimed.clone();
        let taken = self
            .db
            .write(move |tx| {
                if persist::stored_in(tx, &expected.widget_instance_id)?.as_ref() != Some(&expected) {
                    return Ok(false);
                }
                if resume {
                    persist::claim_in(tx, &record, now)?;
                } else {
                    persist::persist_in(tx, &record, now)?;
                }
                Ok(true)
            })
            .await?;
        if !taken {
            log_debug!("Timer on widget {widget_instance_id} changed during recovery");
            return Ok(Recovered::Held);
        }

        if resume {
            log_info!(
                "Resuming timer on widget {} from {}s ({}ms since last tick)",
                widget_instance_id,
                claimed.elapsed_seconds,
                gap_ms
            );
            let cancel = CancellationToken::new();
            let ticker = self.spawn_ticker(widget_instance_id.to_string(), cancel.clone());
            let resumed = ActiveTimer {
                state: claimed,
                cancel,
                ticker: Some(ticker),
            };
            if let Some(mut previous) = arena.insert(widget_instance_id.to_string(), resumed) {
                previous.halt();
            }
            return Ok(Recovered::Resumed);
        }

        let orphan = SyncError::OrphanedTimerSession {
            widget_instance_id: widget_instance_id.to_string(),
            gap_secs: gap_ms / 1000,
        };
        log_warn!("{orphan}; pausing at {}s", claimed.elapsed_seconds);
        if let Some(mut previous) = arena.insert(widget_instance_id.to_string(), ActiveTimer::idle(claimed)) {
            previous.halt();
        }
        Ok(Recovered::Paused)
    }

    /// Re-run recovery for a held session every lease until its keeper
    /// pauses, stops or abandons it.
    fn watch_held(&self, widget_instance_id: String) {
        let keeper = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = keeper.closing.cancelled() => break,
                    _ = time::sleep(keeper.options.ownership_lease) => {}
                }
                match keeper.recheck(&widget_instance_id).await {
                    Ok(Some(Recovered::Held)) => {}
                    Ok(Some(outcome)) => {
                        log_info!("Recovered timer on widget {widget_instance_id}: {outcome:?}");
                        break;
                    }
                    Ok(None) => break,
                    Err(err) => log_warn!("Recovery check for widget {widget_instance_id} failed: {err:?}"),
                }
            }
        });
    }

    async fn recheck(&self, widget_instance_id: &str) -> Result<Option<Recovered>> {
        let mut arena = self.arena.lock().await;
        if arena.get(widget_instance_id).is_some_and(ActiveTimer::is_ticking) {
            return Ok(None);
        }
        let stored: Option<TimerSessionState> = self
            .db
            .get_record(Namespace::Timer, widget_instance_id)
            .await?;
        let Some(state) = stored else {
            if let Some(mut active) = arena.remove(widget_instance_id) {
                active.halt();
            }
            return Ok(None);
        };
        let outcome = self.recover_one(&mut arena, widget_instance_id, state, now_ms()).await?;
        drop(arena);
        if outcome == Recovered::Paused {
            self.notify();
        }
        Ok(Some(outcome))
    }

    fn spawn_ticker(&self, widget_instance_id: String, cancel: CancellationToken) -> JoinHandle<()> {
        let keeper = self.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(keeper.options.tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match keeper.advance(&widget_instance_id, &cancel).await {
                            Ok(TickOutcome::Continue) => {}
                            Ok(TickOutcome::Finished) => break,
                            Err(err) => log_warn!(
                                "Timer tick for widget {} not persisted: {err:?}",
                                widget_instance_id
                            ),
                        }
                    }
                }
            }
            log_debug!("Tick loop for widget {widget_instance_id} ended");
        })
    }

    async fn advance(&self, widget_instance_id: &str, cancel: &CancellationToken) -> Result<TickOutcome> {
        let mut arena = self.arena.lock().await;
        if cancel.is_cancelled() {
            return Ok(TickOutcome::Finished);
        }
        let Some(active) = arena.get(widget_instance_id) else {
            return Ok(TickOutcome::Finished);
        };
        if !active.state.is_running {
            return Ok(TickOutcome::Finished);
        }

        let now = stamp_after(Some(active.state.last_tick_at));
        let mut next = active.state.clone();
        next.tick(now);
        let completion_id = next.reached_target().then(|| Uuid::new_v4().to_string());

        let record = next.clone();
        let cid = completion_id.clone();
        let written = self
            .db
            .write(move |tx| {
                match persist::stored_in(tx, &record.widget_instance_id)? {
                    Some(stored)
                        if stored.is_running && stored.owner == record.owner && stored.habit_id == record.habit_id => {}
                    other => return Ok(TickWrite::Lost(other)),
                }
                match &cid {
                    Some(id) => {
                        let mut done = record;
                        done.is_running = false;
                        persist::complete_in(tx, &done, id, now)?;
                    }
                    None => persist::persist_in(tx, &record, now)?,
                }
                Ok(TickWrite::Persisted)
            })
            .await?;

        if let TickWrite::Lost(stored) = written {
            log_info!("Timer on widget {widget_instance_id} was paused or taken over elsewhere; ending tick loop");
            match stored {
                Some(stored) => {
                    if let Some(active) = arena.get_mut(widget_instance_id) {
                        active.halt();
                        active.state = stored;
                    }
                }
                None => {
                    if let Some(mut active) = arena.remove(widget_instance_id) {
                        active.halt();
                    }
                }
            }
            return Ok(TickOutcome::Finished);
        }

        if let Some(completion_id) = completion_id {
            arena.remove(widget_instance_id);
            drop(arena);
            next.is_running = false;
            completed_timer(next, completion_id, now);
            self.notify();
            return Ok(TickOutcome::Finished);
        }

        log_debug!(
            "Tick {}s for {} on widget {}",
            next.elapsed_seconds,
            next.habit_id,
            widget_instance_id
        );
        if let Some(active) = arena.get_mut(widget_instance_id) {
            active.state = next;
        }
        Ok(TickOutcome::Continue)
    }

    fn notify(&self) {
        if let Some(signal) = &self.signal {
            signal.notify();
        }
    }
}

fn completed_timer(state: TimerSessionState, completion_id: String, completed_at: i64) -> CompletedTimer {
    log_info!(
        "Timer for {} completed after {}s (completion {})",
        state.habit_id,
        state.elapsed_seconds,
        completion_id
    );
    CompletedTimer {
        habit_id: state.habit_id,
        widget_instance_id: state.widget_instance_id,
        completion_id,
        elapsed_seconds: state.elapsed_seconds,
        completed_at,
    }
}

fn from_idle(event: TimerEvent) -> SyncError {
    SyncError::InvalidTransition {
        from: TimerStatus::Idle.as_str(),
        event: event.as_str(),
    }
}

/// Wall-clock millis, strictly after the session's previous stamp so its
/// ledger changes always supersede each other in order.
fn stamp_after(previous: Option<i64>) -> i64 {
    let now = now_ms();
    match previous {
        Some(previous) => now.max(previous + 1),
        None => now,
    }
}
