//! Wires `Ingress`, `BucketTable` (owned by `Ingress`), `Writer`, and
//! `ResourceGovernor` together, and exposes the two entry points spec.md
//! §4.7 grants the external signal-handling collaborator: `shutdown()` and
//! `dump_stats()`.
//!
//! Split into a cheap, cloneable [`Server`] handle and an owned [`Handle`]
//! that represents the running system, the same shape `Writer` uses to
//! separate "ask it to stop" from "wait for it to actually stop" — so
//! `main.rs` can hold the handle in one `tokio::select!` arm while signal
//! streams occupy the others.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::counters::Stats;
use crate::governor;
use crate::ingress::{self, Ingress};
use crate::signals::Shutdown;
use crate::writer::Writer;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Governor(#[from] governor::Error),
    #[error(transparent)]
    Ingress(#[from] ingress::Error),
}

/// Cheap handle for triggering shutdown or a stats dump from a signal
/// handler. Cloning shares the same underlying broadcast.
#[derive(Clone)]
pub struct Server {
    shutdown: Shutdown,
    dump_requested: Arc<Notify>,
    stats: Arc<Stats>,
    local_addr: std::net::SocketAddr,
}

/// The running system. `join` blocks (briefly, via the writer's OS thread
/// join) until both the event loop and the writer have fully stopped, per
/// spec.md §4.7's shutdown sequence: socket closed, writer drained and
/// joined, `BucketTable` dropped without flushing whatever was still open.
pub struct Handle {
    ingress_task: JoinHandle<()>,
    writer: Writer,
}

impl Server {
    /// Bind the socket, spawn the writer thread, and start the ingress loop
    /// as a background task. Returns once the loop is up and listening.
    pub async fn start(config: &Config) -> Result<(Self, Handle), Error> {
        let max_bucket_count = governor::enforce(config.max_bucket_count)?;

        let stats = Arc::new(Stats::new());
        let writer = Writer::spawn(config.storage_path.clone());
        let writer_handle = writer.handle();

        let (shutdown, phase) = Shutdown::new();
        let dump_requested = Arc::new(Notify::new());

        let ingress = Ingress::bind(
            config.bind_addr,
            max_bucket_count,
            config.max_bucket_size,
            config.max_bucket_idle,
            config.max_bucket_ttl,
            writer_handle,
            Arc::clone(&stats),
            phase,
            Arc::clone(&dump_requested),
        )
        .await?;

        let local_addr = ingress
            .local_addr()
            .expect("bound socket always has a local address");
        let ingress_task = tokio::spawn(ingress.run());

        let server = Self {
            shutdown,
            dump_requested,
            stats: Arc::clone(&stats),
            local_addr,
        };
        let handle = Handle {
            ingress_task,
            writer,
        };

        Ok((server, handle))
    }

    /// Signal the event loop to stop reading from the socket. Idempotent.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.signal();
    }

    /// Ask the event loop to log a `SIGUSR1`-style one-line stats summary on
    /// its next iteration.
    pub fn dump_stats(&self) {
        self.dump_requested.notify_one();
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// The address the listen socket actually bound to. Mainly useful for
    /// tests and operators that bind to port 0.
    #[must_use]
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }
}

impl Handle {
    /// Wait for the ingress loop to exit (after [`Server::shutdown`]) and
    /// then stop and join the writer thread.
    pub async fn join(self) {
        let _ = self.ingress_task.await;
        self.writer.join();
    }
}
