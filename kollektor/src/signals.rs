//! In-process shutdown broadcast, in the shape the teacher's generator and
//! blackhole modules expect (`crate::signals::Shutdown` handed out at
//! startup, a cheaply-cloneable receiver handed to each worker).
//!
//! The actual `SIGTERM`/`SIGINT`/`SIGUSR1` plumbing is the external
//! collaborator spec.md §1 describes; this module is only the core's
//! exposed entry point for that collaborator to drive.

use tokio::sync::watch;

/// The sending half. Calling [`Shutdown::signal`] wakes every [`Phase`]
/// cloned from it, exactly once; repeat calls are harmless.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

/// The receiving half, handed to a worker so it can race `recv()` against
/// its normal work in a `tokio::select!`.
#[derive(Debug, Clone)]
pub struct Phase {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    #[must_use]
    pub fn new() -> (Self, Phase) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, Phase { rx })
    }

    /// Wake every outstanding [`Phase::recv`]. Idempotent.
    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }
}

impl Phase {
    /// Resolves once [`Shutdown::signal`] has been called. If it already
    /// has been, resolves immediately.
    pub async fn recv(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        let _ = self.rx.changed().await;
    }

    #[must_use]
    pub fn is_signaled(&self) -> bool {
        *self.rx.borrow()
    }
}
