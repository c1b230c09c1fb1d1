//! Shared durable store.
//!
//! Every surface (main app, widget trigger context, timer keeper) opens its
//! own `Database` handle on the same SQLite file. A handle owns one connection
//! on a dedicated worker thread, so statements from one handle are totally
//! ordered; cross-handle atomicity comes from `BEGIN IMMEDIATE` transactions
//! and the busy timeout.

use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use log::{error, info};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tokio::sync::oneshot;

pub mod helpers;
pub mod keys;
mod migrations;
pub mod repositories;

use migrations::run_migrations;

use crate::error::SyncError;

pub use keys::Namespace;

/// Extra time the caller waits past the in-task deadline, so a commit that
/// passed its deadline check is still observed.
const DEADLINE_GRACE: Duration = Duration::from_millis(250);

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: Mutex<mpsc::Sender<DbCommand>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            let sender = match self.sender.lock() {
                Ok(sender) => sender,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Err(err) = sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to DB thread: {err}");
            }
            drop(sender);
            if let Err(join_err) = handle.join() {
                error!("Failed to join DB thread: {join_err:?}");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub busy_timeout: Duration,
    /// Label for the worker thread, e.g. "app" or "widget".
    pub surface: String,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(1500),
            surface: "app".into(),
        }
    }
}

#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    db_path: Arc<PathBuf>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        Self::open(db_path, DatabaseOptions::default())
    }

    pub fn open(db_path: PathBuf, options: DatabaseOptions) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();
        let busy_timeout = options.busy_timeout;

        let worker = thread::Builder::new()
            .name(format!("memento-db-{}", options.surface))
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open SQLite database")));
                        return;
                    }
                };

                if let Err(err) = conn.busy_timeout(busy_timeout) {
                    error!("Failed to set busy timeout: {err}");
                }
                if let Err(err) = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get::<_, String>(0)
                }) {
                    error!("Failed to enable WAL mode: {err}");
                }
                if let Err(err) = conn.pragma_update(None, "synchronous", "FULL") {
                    error!("Failed to set synchronous=FULL: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run database migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("DB initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Database thread shutting down");
            })
            .with_context(|| "failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited before signaling readiness")??;

        info!(
            "Database ({}) initialized at {}",
            options.surface,
            db_path.as_path().display()
        );

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: Mutex::new(command_tx),
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("DB caller dropped before receiving result");
            }
        }));

        {
            let sender = self
                .inner
                .sender
                .lock()
                .map_err(|_| anyhow!("database sender lock poisoned"))?;
            sender
                .send(command)
                .map_err(|err| anyhow!("failed to send command to DB thread: {err}"))?;
        }

        reply_rx
            .await
            .map_err(|_| anyhow!("database thread terminated unexpectedly"))?
    }

    /// Run `task` inside one `BEGIN IMMEDIATE` transaction and commit it.
    pub async fn write<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.execute(move |conn| {
            let tx = begin_immediate(conn)?;
            let value = task(&tx)?;
            tx.commit().map_err(SyncError::durable)?;
            Ok(value)
        })
        .await
    }

    /// Like [`Database::write`], but bounded: the transaction is rolled back if
    /// it cannot commit before `timeout`, and the caller stops waiting shortly
    /// after. Either way the result is [`SyncError::WriteTimeout`].
    pub async fn write_with_deadline<F, T>(&self, timeout: Duration, task: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let timeout_ms = timeout.as_millis() as u64;
        let deadline = Instant::now() + timeout;
        let fut = self.execute(move |conn| {
            if Instant::now() >= deadline {
                return Err(SyncError::WriteTimeout { timeout_ms }.into());
            }
            let tx = begin_immediate(conn)?;
            let value = task(&tx)?;
            helpers::commit_before(tx, deadline, timeout_ms)?;
            Ok(value)
        });

        match tokio::time::timeout(timeout + DEADLINE_GRACE, fut).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::WriteTimeout { timeout_ms }.into()),
        }
    }

    /// Toggle `PRAGMA query_only`. While on, every write on this handle fails,
    /// which is how a surface is put into a maintenance (read-only) mode.
    pub async fn set_query_only(&self, enabled: bool) -> Result<()> {
        self.execute(move |conn| {
            conn.pragma_update(None, "query_only", enabled)
                .context("failed to toggle query_only")?;
            Ok(())
        })
        .await
    }
}

fn begin_immediate(conn: &mut Connection) -> Result<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|err| SyncError::durable(err).into())
}
