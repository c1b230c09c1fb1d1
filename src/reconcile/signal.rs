//! Coalescing "ledger is dirty" signal from producers (widget handler, timer
//! keeper) to the reconciliation engine. Capacity is one, so any number of
//! signals raised before the engine wakes collapse into a single pass.

use tokio::sync::mpsc::{self, error::TrySendError};

const ENABLE_LOGS: bool = true;

use crate::log_debug;

#[derive(Clone, Debug)]
pub struct DirtySignal {
    tx: mpsc::Sender<()>,
}

#[derive(Debug)]
pub struct DirtyReceiver {
    rx: mpsc::Receiver<()>,
}

pub fn dirty_channel() -> (DirtySignal, DirtyReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (DirtySignal { tx }, DirtyReceiver { rx })
}

impl DirtySignal {
    /// Returns `false` when a pass is already pending (or the engine is gone).
    pub fn notify(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => false,
            Err(TrySendError::Closed(())) => {
                log_debug!("Dirty signal raised after the listener stopped");
                false
            }
        }
    }
}

impl DirtyReceiver {
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}
