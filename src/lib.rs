pub mod db;
pub mod error;
pub mod ledger;
pub mod models;
pub mod reconcile;
pub mod settings;
pub mod snapshot;
pub mod timer;
pub mod utils;
pub mod widget;

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use db::{Database, DatabaseOptions};
use ledger::Ledger;
use models::{Acknowledgement, MutationRequest, Snapshot, WidgetBinding};
use reconcile::{dirty_channel, DirtyReceiver, DirtySignal, ReconcileOutcome, ReconciliationEngine};
use settings::{SettingsStore, SyncSettings};
use snapshot::SnapshotPublisher;
use timer::{KeeperOptions, RecoveryReport, TimerSessionKeeper};
use utils::now_ms;
use widget::WidgetMutationHandler;

const ENABLE_LOGS: bool = true;

pub const DATABASE_FILE: &str = "memento.sqlite3";
pub const SETTINGS_FILE: &str = "settings.json";

/// One execution surface wired together over its own store handle. The main
/// application and every widget-trigger context each open one of these on
/// the same database file.
pub struct SyncApp {
    settings: SyncSettings,
    db: Database,
    ledger: Ledger,
    publisher: SnapshotPublisher,
    keeper: TimerSessionKeeper,
    engine: ReconciliationEngine,
    handler: WidgetMutationHandler,
    receiver: Option<DirtyReceiver>,
    signal: DirtySignal,
    cancel: CancellationToken,
    listener: Option<JoinHandle<()>>,
}

impl SyncApp {
    pub fn open(db_path: PathBuf, settings: SyncSettings, surface: &str) -> Result<Self> {
        let db = Database::open(
            db_path,
            DatabaseOptions {
                busy_timeout: settings.busy_timeout(),
                surface: surface.to_string(),
            },
        )?;

        let (signal, receiver) = dirty_channel();
        let publisher = SnapshotPublisher::new(db.clone());
        let keeper =
            TimerSessionKeeper::new(db.clone(), KeeperOptions::from(&settings)).with_signal(signal.clone());
        let engine = ReconciliationEngine::new(db.clone(), publisher.clone(), settings.max_apply_attempts);
        let handler = WidgetMutationHandler::new(db.clone(), keeper.clone(), settings.write_timeout())
            .with_signal(signal.clone());

        Ok(Self {
            ledger: Ledger::new(db.clone()),
            settings,
            db,
            publisher,
            keeper,
            engine,
            handler,
            receiver: Some(receiver),
            signal,
            cancel: CancellationToken::new(),
            listener: None,
        })
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn publisher(&self) -> &SnapshotPublisher {
        &self.publisher
    }

    pub fn keeper(&self) -> &TimerSessionKeeper {
        &self.keeper
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub fn signal(&self) -> DirtySignal {
        self.signal.clone()
    }

    /// Host trigger entry point for a widget tap.
    pub async fn handle_widget(&self, request: MutationRequest) -> Acknowledgement {
        self.handler.handle(request).await
    }

    /// Resume-to-foreground lifecycle event.
    pub async fn on_resume(&self) -> Result<ReconcileOutcome> {
        self.engine.on_resume().await
    }

    pub async fn recover_timers(&self) -> Result<RecoveryReport> {
        self.keeper.recover_orphans(now_ms()).await
    }

    pub async fn register_widget(&self, binding: WidgetBinding) -> Result<Snapshot> {
        self.publisher.register_widget(binding).await
    }

    /// The user removed a placed widget: discard its timer, then its records.
    pub async fn remove_widget(&self, widget_instance_id: &str) -> Result<()> {
        if let Err(err) = self.keeper.stop(widget_instance_id).await {
            log_warn!("Could not stop timer of removed widget {widget_instance_id}: {err:?}");
        }
        self.publisher.remove_widget(widget_instance_id).await
    }

    /// Start reconciling on every dirty signal. Returns `false` if the
    /// listener was already started.
    pub fn start_listener(&mut self) -> bool {
        let Some(receiver) = self.receiver.take() else {
            return false;
        };
        self.listener = Some(self.engine.spawn_listener(receiver, self.cancel.clone()));
        true
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(listener) = self.listener.take() {
            if let Err(err) = listener.await {
                log_error!("Reconciliation listener ended abnormally: {err}");
            }
        }
        self.keeper.shutdown().await;
    }
}

/// Main-application process: recover, reconcile once, then follow dirty
/// signals until Ctrl-C.
pub async fn run() -> Result<()> {
    let data_dir = settings::data_dir_from_env();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let store = SettingsStore::new(data_dir.join(SETTINGS_FILE))?;
    let settings = store.current();
    utils::logging::init(&settings.log_level, settings::debug_from_env());

    log_info!("Memento sync starting up in {}", data_dir.display());

    let mut app = SyncApp::open(data_dir.join(DATABASE_FILE), settings, "app")?;

    let recovery = app.recover_timers().await?;
    log_info!(
        "Timer recovery: {} resumed, {} paused, {} reloaded, {} held by another surface",
        recovery.resumed.len(),
        recovery.paused.len(),
        recovery.reloaded.len(),
        recovery.held.len()
    );

    // Process start counts as a resume.
    match app.on_resume().await {
        Ok(ReconcileOutcome::Completed(report)) => {
            log_info!("Initial reconciliation applied {} entit(ies)", report.applied.len())
        }
        Ok(ReconcileOutcome::Skipped) => {}
        Err(err) => log_error!("Initial reconciliation failed: {err:?}"),
    }

    app.start_listener();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    log_info!("Shutting down");
    app.shutdown().await;
    Ok(())
}
