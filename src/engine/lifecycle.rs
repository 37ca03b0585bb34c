//! Running → ShuttingDown → Stopped.
//!
//! The lifecycle owns the consumer tasks and the cancellation token they
//! share. It waits for the first shutdown request (signal, tracker drain,
//! consumer failure), cancels the token, and then waits for every task to
//! finish whatever it has in flight. There is no drain timeout.

use super::shutdown::{ShutdownHandle, ShutdownListener, ShutdownReason, shutdown_channel};
use crate::error::Result;
use std::future::Future;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    ShuttingDown,
    Stopped,
}

type TaskOutput = (&'static str, Result<()>);

pub struct Lifecycle {
    token: CancellationToken,
    handle: ShutdownHandle,
    listener: ShutdownListener,
    tasks: JoinSet<TaskOutput>,
    state: watch::Sender<LifecycleState>,
    handle_signals: bool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (handle, listener) = shutdown_channel();
        let (state, _) = watch::channel(LifecycleState::Running);
        Self {
            token: CancellationToken::new(),
            handle,
            listener,
            tasks: JoinSet::new(),
            state,
            handle_signals: true,
        }
    }

    /// Don't install SIGINT/SIGTERM handlers; only explicit requests stop it.
    pub fn without_signals(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    /// Token consumers poll once per loop iteration.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn handle(&self) -> ShutdownHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Run a consumer task under this lifecycle.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.spawn(async move { (name, task.await) });
        info!(task = name, "consumer started");
    }

    /// Wait for a shutdown request, then cancel and drain every task.
    ///
    /// # Errors
    ///
    /// Fails only if signal handlers cannot be installed.
    pub async fn run(mut self) -> Result<ShutdownReason> {
        let mut signals = if self.handle_signals {
            Some(Signals::install()?)
        } else {
            None
        };

        let reason = loop {
            tokio::select! {
                biased;
                Some(reason) = self.listener.recv() => break reason,
                reason = next_signal(&mut signals) => break reason,
                joined = self.tasks.join_next() => match joined {
                    None => break ShutdownReason::ConsumersFinished,
                    Some(joined) => {
                        if !report(joined) {
                            break ShutdownReason::ConsumerFailed;
                        }
                    }
                },
            }
        };

        info!(?reason, "shutting down");
        self.state.send_replace(LifecycleState::ShuttingDown);
        self.token.cancel();

        while let Some(joined) = self.tasks.join_next().await {
            report(joined);
        }

        self.state.send_replace(LifecycleState::Stopped);
        info!("shutdown complete");
        Ok(reason)
    }
}

/// Log how a task ended. Returns false if it failed.
fn report(joined: std::result::Result<TaskOutput, JoinError>) -> bool {
    match joined {
        Ok((name, Ok(()))) => {
            info!(task = name, "consumer finished");
            true
        }
        Ok((name, Err(e))) => {
            error!(task = name, error = %e, "consumer failed");
            false
        }
        Err(e) => {
            error!(error = %e, "consumer task panicked");
            false
        }
    }
}

async fn next_signal(signals: &mut Option<Signals>) -> ShutdownReason {
    match signals {
        Some(signals) => signals.recv().await,
        None => std::future::pending().await,
    }
}

/// SIGINT/SIGTERM listeners (Ctrl+C off unix).
struct Signals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl Signals {
    fn install() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    async fn recv(&mut self) -> ShutdownReason {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.interrupt.recv() => ShutdownReason::Interrupt,
                _ = self.terminate.recv() => ShutdownReason::Terminate,
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            ShutdownReason::Interrupt
        }
    }
}
