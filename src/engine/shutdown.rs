//! Shutdown requests.
//!
//! Anything that wants the process to stop (OS signals, the entity tracker,
//! a failed consumer) sends a [`ShutdownReason`] through a
//! [`ShutdownHandle`]. The lifecycle owns the matching listener.

use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT or Ctrl+C.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// Every tracked entity has completed.
    Drained,
    /// A caller asked for shutdown directly.
    Requested,
    /// A consumer task returned an error or panicked.
    ConsumerFailed,
    /// Every consumer task ended on its own.
    ConsumersFinished,
}

impl ShutdownReason {
    /// Whether this reason counts as a clean stop for exit status purposes.
    pub fn is_graceful(self) -> bool {
        !matches!(self, ShutdownReason::ConsumerFailed)
    }
}

/// Cloneable sender of shutdown requests.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: mpsc::UnboundedSender<ShutdownReason>,
}

impl ShutdownHandle {
    pub fn request(&self, reason: ShutdownReason) {
        if self.tx.send(reason).is_err() {
            debug!(?reason, "shutdown listener already gone");
        }
    }
}

#[derive(Debug)]
pub struct ShutdownListener {
    rx: mpsc::UnboundedReceiver<ShutdownReason>,
}

impl ShutdownListener {
    /// Wait for the next request. `None` once every handle is dropped.
    pub async fn recv(&mut self) -> Option<ShutdownReason> {
        self.rx.recv().await
    }

    /// Take a pending request without waiting.
    pub fn try_recv(&mut self) -> Option<ShutdownReason> {
        self.rx.try_recv().ok()
    }
}

pub fn shutdown_channel() -> (ShutdownHandle, ShutdownListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ShutdownHandle { tx }, ShutdownListener { rx })
}
