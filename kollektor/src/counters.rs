//! Fixed-window moving-average counters and the process-wide statistics
//! these counters feed into the `SIGUSR1` summary.
//!
//! This is the one piece of the core that must not be reimplemented on top
//! of the `metrics` crate: spec.md §4.1 specifies an exact ring-buffer
//! windowing algorithm, and the `SIGUSR1` dump is a textual summary of that
//! specific algorithm's output, not of whatever a generic metrics backend
//! happens to report.

use std::sync::atomic::{AtomicU64, Ordering};

/// A fixed-window moving average of a scalar rate.
///
/// `W` cells, each holding the sum of deltas whose `floor(now)` maps to that
/// cell (`now as u64 % W`). On `update`, every cell whose timestamp is
/// stale (older than `now - W + 1`) is zeroed before the new delta is
/// folded in, so the ring never needs an explicit reset pass.
///
/// Not thread-safe: only ever touched from the ingress event loop.
#[derive(Debug, Clone)]
pub struct PerformanceCounter<const W: usize> {
    cells: [f64; W],
    cell_timestamp: [i64; W],
}

impl<const W: usize> Default for PerformanceCounter<W> {
    fn default() -> Self {
        Self {
            cells: [0.0; W],
            cell_timestamp: [i64::MIN; W],
        }
    }
}

impl<const W: usize> PerformanceCounter<W> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `delta` as having occurred at `now_seconds`.
    pub fn update(&mut self, now_seconds: f64, delta: f64) {
        let now = now_seconds.floor() as i64;
        let idx = now.rem_euclid(W as i64) as usize;

        // Zero every cell that has fallen out of the window, including this
        // one if it belongs to a prior lap of the ring.
        let window_start = now - (W as i64) + 1;
        for i in 0..W {
            if self.cell_timestamp[i] < window_start {
                self.cells[i] = 0.0;
                self.cell_timestamp[i] = i64::MIN;
            }
        }

        if self.cell_timestamp[idx] != now {
            self.cells[idx] = 0.0;
        }
        self.cells[idx] += delta;
        self.cell_timestamp[idx] = now;
    }

    /// The sum of all (non-stale) cells divided by the window width.
    ///
    /// Callers are expected to call `update(now, 0.0)` first if they want
    /// the average to reflect elapsed idle time; `average` itself does not
    /// know the current wall-clock time.
    #[must_use]
    pub fn average(&self) -> f64 {
        self.cells.iter().sum::<f64>() / (W as f64)
    }
}

/// Window width used for every rate counter in this program: 8 seconds, a
/// small power of two per spec.md §4.1.
pub const WINDOW_SECONDS: usize = 8;

/// Reasons a bucket was flushed, used both for the `kills_*` counters in the
/// `SIGUSR1` dump and as the `reason` label on the `kollektor_kills_total`
/// metric (see SPEC_FULL.md §F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// `item_count` reached `max_bucket_size`.
    MaxSize,
    /// The idle timer fired.
    MaxIdle,
    /// The TTL timer fired.
    MaxAge,
    /// An append to the bucket's stream buffer failed.
    SysError,
}

impl FlushReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FlushReason::MaxSize => "size",
            FlushReason::MaxIdle => "idle",
            FlushReason::MaxAge => "ttl",
            FlushReason::SysError => "syserr",
        }
    }
}

/// Process-wide counters sampled by the `SIGUSR1` handler and, as plain
/// atomics, safe to read from any thread without locking the ingress loop.
///
/// The rate-producing fields (`bytes_read`, `bytes_processed`,
/// `messages_processed`) are maintained as [`PerformanceCounter`] rings on
/// the ingress thread; [`Stats`] only holds the always-consistent totals and
/// gauges that do not need windowing.
#[derive(Debug, Default)]
pub struct Stats {
    pub dropped_messages: AtomicU64,
    pub messages_processed: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_processed: AtomicU64,
    pub kills_idle: AtomicU64,
    pub kills_ttl: AtomicU64,
    pub kills_size: AtomicU64,
    pub kills_syserr: AtomicU64,
    pub active_buckets: AtomicU64,
}

impl Stats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_kill(&self, reason: FlushReason) {
        let counter = match reason {
            FlushReason::MaxSize => &self.kills_size,
            FlushReason::MaxIdle => &self.kills_idle,
            FlushReason::MaxAge => &self.kills_ttl,
            FlushReason::SysError => &self.kills_syserr,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("kollektor_kills_total", "reason" => reason.as_str()).increment(1);
    }

    /// Render the one-line summary `SIGUSR1` dumps, per spec.md §6.
    #[must_use]
    pub fn summary_line(
        &self,
        bytes_read_per_sec: f64,
        bytes_processed_per_sec: f64,
        messages_per_sec: f64,
    ) -> String {
        format!(
            "dropped={dropped} active={active} kills_idle={kidle} kills_ttl={kttl} \
             kills_size={ksize} kills_syserr={ksys} bytes_read_per_sec={brps:.2} \
             bytes_processed_per_sec={bpps:.2} messages_per_sec={mps:.2}",
            dropped = self.dropped_messages.load(Ordering::Relaxed),
            active = self.active_buckets.load(Ordering::Relaxed),
            kidle = self.kills_idle.load(Ordering::Relaxed),
            kttl = self.kills_ttl.load(Ordering::Relaxed),
            ksize = self.kills_size.load(Ordering::Relaxed),
            ksys = self.kills_syserr.load(Ordering::Relaxed),
            brps = bytes_read_per_sec,
            bpps = bytes_processed_per_sec,
            mps = messages_per_sec,
        )
    }
}
