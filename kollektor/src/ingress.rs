//! §4.5 `Ingress`: the single-threaded UDP receive/dispatch event loop.
//!
//! Runs on a `tokio` current-thread runtime (spec.md §9: "single-threaded
//! by design, not by accident" — `BucketTable` and the `PerformanceCounter`
//! rings are touched from here and nowhere else). Per-bucket idle and TTL
//! timers are modeled with two `tokio_util::time::DelayQueue`s keyed by key
//! bytes rather than a field on `Bucket` pointing back at this struct,
//! avoiding the cyclic reference spec.md §9 flags. A fired timer only
//! carries key bytes; the handler re-checks the table before acting, so a
//! stale timer for an already-flushed (or since-recreated) bucket is a
//! harmless no-op rather than something that must be eagerly cancelled.

use std::future::pending;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio_util::time::delay_queue::Expired;
use tokio_util::time::DelayQueue;
use tracing::{debug, info, trace, warn};

use crate::bucket::{self, Bucket};
use crate::bucket_table::BucketTable;
use crate::counters::{FlushReason, PerformanceCounter, Stats, WINDOW_SECONDS};
use crate::signals::Phase;
use crate::writer::WriterHandle;

/// Datagrams larger than this are still received (the kernel enforces its
/// own ceiling) but a 4096-byte stack buffer is what spec.md §4.5 sizes the
/// receive path to; nothing in the original ever sent a larger record.
const RECV_BUFFER_SIZE: usize = 4096;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to bind UDP socket on {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),
}

/// Everything the event loop needs, gathered so `Server` can construct it in
/// one call.
pub struct Ingress {
    socket: UdpSocket,
    table: BucketTable,
    writer: WriterHandle,
    stats: Arc<Stats>,
    shutdown: Phase,
    dump_requested: Arc<Notify>,

    idle_timers: DelayQueue<Vec<u8>>,
    ttl_timers: DelayQueue<Vec<u8>>,
    max_bucket_size: usize,
    max_bucket_idle: Duration,
    max_bucket_ttl: Duration,

    bytes_read_rate: PerformanceCounter<WINDOW_SECONDS>,
    bytes_processed_rate: PerformanceCounter<WINDOW_SECONDS>,
    messages_rate: PerformanceCounter<WINDOW_SECONDS>,
}

impl Ingress {
    /// Bind the listen socket and assemble the event loop. Does not start
    /// running it; call [`Ingress::run`] for that.
    pub async fn bind(
        bind_addr: SocketAddr,
        max_bucket_count: usize,
        max_bucket_size: usize,
        max_bucket_idle: Duration,
        max_bucket_ttl: Duration,
        writer: WriterHandle,
        stats: Arc<Stats>,
        shutdown: Phase,
        dump_requested: Arc<Notify>,
    ) -> Result<Self, Error> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| Error::Bind(bind_addr, e))?;
        info!(%bind_addr, "ingress socket bound");

        Ok(Self {
            socket,
            table: BucketTable::new(max_bucket_count),
            writer,
            stats,
            shutdown,
            dump_requested,
            idle_timers: DelayQueue::new(),
            ttl_timers: DelayQueue::new(),
            max_bucket_size,
            max_bucket_idle,
            max_bucket_ttl,
            bytes_read_rate: PerformanceCounter::new(),
            bytes_processed_rate: PerformanceCounter::new(),
            messages_rate: PerformanceCounter::new(),
        })
    }

    /// The address the listen socket is actually bound to (useful when
    /// binding to port 0).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Run the event loop until shutdown is signaled. Returns once the
    /// socket has stopped being read from; the caller (`Server`) is
    /// responsible for stopping and joining the writer afterward.
    pub async fn run(mut self) {
        let mut buf = [0u8; RECV_BUFFER_SIZE];

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.recv() => {
                    info!("ingress loop shutting down");
                    return;
                }

                () = self.dump_requested.notified() => {
                    self.dump_stats();
                }

                expired = next_expired(&mut self.idle_timers) => {
                    if let Some(expired) = expired {
                        self.handle_idle_expiry(expired);
                    }
                }

                expired = next_expired(&mut self.ttl_timers) => {
                    if let Some(expired) = expired {
                        self.handle_ttl_expiry(expired);
                    }
                }

                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((n, _peer)) => {
                            let now = bucket::now_seconds();
                            self.handle_datagram(&buf[..n], now);
                        }
                        Err(e) => warn!("recv_from failed: {e}"),
                    }
                }
            }

            let open = self.table.len() as u64;
            self.stats.active_buckets.store(open, Ordering::Relaxed);
            metrics::gauge!("kollektor_buckets_open").set(open as f64);
        }
    }

    /// Dispatch a single datagram, per spec.md §4.5's numbered steps: the
    /// capacity check precedes parsing, so a malformed datagram received
    /// while at capacity is still counted as a drop, not a parse failure.
    fn handle_datagram(&mut self, data: &[u8], now: f64) {
        self.bytes_read_rate.update(now, data.len() as f64);
        self.stats
            .bytes_read
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        metrics::counter!("kollektor_bytes_read_total").increment(data.len() as u64);

        if self.table.would_exceed_capacity() {
            self.stats.dropped_messages.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("kollektor_dropped_messages_total").increment(1);
            trace!("dropped datagram: bucket table at capacity");
            return;
        }

        // spec.md's own step ordering (§4.5 step 2 updates bytes_processed
        // before step 3's malformed check) and its error table (§7
        // MalformedDatagram: "no counter update beyond bytes_read")
        // disagree on whether a malformed datagram counts toward
        // bytes_processed. This follows §7, the per-error-kind policy
        // table: bytes_processed is meant to track bytes that entered a
        // bucket, and a malformed datagram never does.
        let Some((key, value)) = split_key_value(data) else {
            trace!("dropped datagram: no ';' separator");
            return;
        };

        self.bytes_processed_rate.update(now, data.len() as f64);
        self.stats
            .bytes_processed
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        metrics::counter!("kollektor_bytes_processed_total").increment(data.len() as u64);

        let outcome = self.table.lookup_mut(key).map(|bucket| {
            bucket
                .append(value)
                .map(|()| bucket.idle_timer_key())
        });

        let (appended, syserr) = match outcome {
            Some(Ok(idle_key)) => {
                if let Some(idle_key) = idle_key {
                    self.idle_timers.reset(&idle_key, self.max_bucket_idle);
                }
                (true, false)
            }
            Some(Err(_)) => (false, true),
            None => (self.create_and_append(key, value, now), false),
        };

        if syserr {
            self.flush_key(key, FlushReason::SysError);
            return;
        }

        if !appended {
            return;
        }

        self.messages_rate.update(now, 1.0);
        self.stats.messages_processed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("kollektor_messages_processed_total").increment(1);

        let at_capacity = self
            .table
            .lookup_mut(key)
            .map(|b| b.at_capacity(self.max_bucket_size))
            .unwrap_or(false);
        if at_capacity {
            self.flush_key(key, FlushReason::MaxSize);
        }
    }

    /// Admit a brand-new bucket for `key`, arm its timers, and append the
    /// first value. The capacity check in [`Self::handle_datagram`] already
    /// ran this tick on a single-threaded loop, so `BucketTable::admit`
    /// rejecting here would mean the invariant broke elsewhere.
    fn create_and_append(&mut self, key: &[u8], value: &[u8], now: f64) -> bool {
        let mut new_bucket = match Bucket::create(key, now) {
            Ok(b) => b,
            Err(_) => {
                debug!("bucket allocation failed, dropping datagram");
                return false;
            }
        };

        let idle_key = self.idle_timers.insert(key.to_vec(), self.max_bucket_idle);
        let ttl_key = self.ttl_timers.insert(key.to_vec(), self.max_bucket_ttl);
        new_bucket.set_timer_keys(idle_key, ttl_key);

        if new_bucket.append(value).is_err() {
            self.stats.record_kill(FlushReason::SysError);
            return false;
        }

        match self.table.admit(new_bucket) {
            Ok(_) => true,
            Err(_) => {
                warn!("admit rejected a bucket that passed the prior capacity check");
                false
            }
        }
    }

    /// Detach `key` from the table and hand it to the writer. Stops both
    /// timers (spec.md §4.2 `flush`: "stops both timers (idempotent)") by
    /// removing whichever of the bucket's `DelayQueue` entries did not
    /// already fire to produce this flush — a timer-triggered flush has
    /// already consumed its own entry via `poll_expired`, so removing it
    /// again would panic; the *other* entry is still live and must be
    /// cancelled here or it lingers in its queue until it expires on its
    /// own, waking the loop later for a no-op.
    fn flush_key(&mut self, key: &[u8], reason: FlushReason) {
        if let Some(bucket) = self.table.detach(key) {
            if reason != FlushReason::MaxIdle {
                if let Some(idle_key) = bucket.idle_timer_key() {
                    self.idle_timers.remove(&idle_key);
                }
            }
            if reason != FlushReason::MaxAge {
                if let Some(ttl_key) = bucket.ttl_timer_key() {
                    self.ttl_timers.remove(&ttl_key);
                }
            }

            self.stats.record_kill(reason);
            debug!(
                key = %String::from_utf8_lossy(key),
                reason = reason.as_str(),
                items = bucket.item_count(),
                "flushing bucket"
            );
            self.writer.push(bucket);
        }
    }

    fn handle_idle_expiry(&mut self, expired: Expired<Vec<u8>>) {
        let timer_key = expired.key();
        let key = expired.into_inner();
        let live = self
            .table
            .lookup_mut(&key)
            .and_then(Bucket::idle_timer_key)
            == Some(timer_key);
        if live {
            self.flush_key(&key, FlushReason::MaxIdle);
        }
    }

    fn handle_ttl_expiry(&mut self, expired: Expired<Vec<u8>>) {
        let timer_key = expired.key();
        let key = expired.into_inner();
        let live = self
            .table
            .lookup_mut(&key)
            .and_then(Bucket::ttl_timer_key)
            == Some(timer_key);
        if live {
            self.flush_key(&key, FlushReason::MaxAge);
        }
    }

    /// Render and log the `SIGUSR1` summary line (spec.md §6). Calling
    /// `update(now, 0.0)` first lets the rates decay toward zero across
    /// windows with no traffic, since `PerformanceCounter::average` has no
    /// notion of wall-clock time on its own.
    fn dump_stats(&mut self) {
        let now = bucket::now_seconds();
        self.bytes_read_rate.update(now, 0.0);
        self.bytes_processed_rate.update(now, 0.0);
        self.messages_rate.update(now, 0.0);

        let line = self.stats.summary_line(
            self.bytes_read_rate.average(),
            self.bytes_processed_rate.average(),
            self.messages_rate.average(),
        );
        info!("{line}");
    }
}

/// Split a raw datagram into `(key, value)` at its first `;`, per spec.md
/// §4.5 step 3. `value` retains its leading `;` so appending it to a
/// bucket's stream never needs to re-insert the separator. Returns `None`
/// for a datagram with no `;` at all (silently discarded, spec.md §7
/// `MalformedDatagram`).
fn split_key_value(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let sep = data.iter().position(|&b| b == b';')?;
    Some((&data[..sep], &data[sep..]))
}

/// Await the next expired entry in `dq`, without busy-looping `poll_expired`
/// when the queue holds nothing at all (an empty `DelayQueue` returns
/// `Poll::Ready(None)` immediately rather than `Pending`).
async fn next_expired(dq: &mut DelayQueue<Vec<u8>>) -> Option<Expired<Vec<u8>>> {
    if dq.is_empty() {
        return pending().await;
    }
    std::future::poll_fn(|cx| dq.poll_expired(cx)).await
}
