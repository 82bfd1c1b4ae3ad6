//! Turns termination signals into cancellation of the workers.
//!
//! The first signal asks every worker to stop. Any signal after that, whether
//! the workers are still stopping or have already finished, exits the process
//! straight away.

use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use courier_common::internal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Exit status used when a repeated signal forces the process down.
pub const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Running,
    Stopping,
    Stopped,
}

impl Phase {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// What a signal should lead to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Workers were asked to stop.
    Stop,
    /// Exit without waiting for anything.
    ForceExit,
}

#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    phase: Arc<AtomicU8>,
}

impl ShutdownCoordinator {
    /// Coordinate shutdown of everything watching `token`.
    #[must_use]
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            phase: Arc::new(AtomicU8::new(Phase::Running as u8)),
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// React to one signal.
    pub fn signal(&self, signal: Signal) -> Action {
        let first = self
            .phase
            .compare_exchange(
                Phase::Running as u8,
                Phase::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if !first {
            internal!(level = WARN, "{signal:?} received again, forcing shutdown");
            return Action::ForceExit;
        }

        match signal {
            Signal::Interrupt => {
                internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
            }
            Signal::Terminate => {
                internal!(level = INFO, "Terminate Signal received, shutting down");
            }
        }
        self.token.cancel();

        Action::Stop
    }

    /// Record that the top-level run has returned.
    pub fn finished(&self) {
        self.phase.store(Phase::Stopped as u8, Ordering::Release);
        internal!(level = INFO, "Shutdown complete");
    }

    /// Handle signals from `signals` until one forces an exit or the sender
    /// goes away. `exit` is called with [`FORCED_EXIT_CODE`] on a forced exit.
    pub async fn watch<F>(&self, mut signals: mpsc::UnboundedReceiver<Signal>, exit: F)
    where
        F: Fn(i32),
    {
        while let Some(signal) = signals.recv().await {
            if self.signal(signal) == Action::ForceExit {
                exit(FORCED_EXIT_CODE);
                return;
            }
        }
    }
}

/// Forward SIGINT and SIGTERM to `sender` until it is closed.
pub fn forward_os_signals(sender: mpsc::UnboundedSender<Signal>) -> std::io::Result<()> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::spawn(async move {
        loop {
            let signal = tokio::select! {
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => Signal::Interrupt,
                    Err(err) => {
                        internal!(level = ERROR, "Unable to listen for CTRL+C: {err}");
                        return;
                    }
                },
                _ = terminate.recv() => Signal::Terminate,
            };

            if sender.send(signal).is_err() {
                return;
            }
        }
    });

    Ok(())
}
