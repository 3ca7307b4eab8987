//! §4.2 `Bucket`: the per-key accumulator.
//!
//! The stream buffer is a plain growable `Vec<u8>` rather than an immutable
//! string: appends are amortized O(1) and handing the bucket to the writer
//! is a move, never a copy (see SPEC_FULL.md §A / spec.md §9 "Hot-path
//! buffer vs. string"). `Bucket::create`'s `ResourceUnavailable` failure
//! mode is modeled with `Vec::try_reserve`, the one fallible-allocation hook
//! the standard library actually exposes.

use std::fmt::Write as _;
use std::time::SystemTime;

use tokio_util::time::delay_queue::Key as TimerKey;

use crate::counters::FlushReason;

/// Initial capacity reserved for a bucket's stream buffer: a header plus a
/// handful of small values, comfortably inside one page.
const INITIAL_STREAM_CAPACITY: usize = 256;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Allocation of the stream buffer failed (spec.md §4.2, §7 `BucketAllocFail`).
    #[error("failed to allocate stream buffer for bucket")]
    ResourceUnavailable,
}

/// Wall-clock seconds, fractional, matching the original's `ev_now` /
/// spec.md §3 `first_seen`.
#[must_use]
pub fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// A single key's open accumulation.
///
/// Owns its stream buffer outright; once handed to the [`crate::writer`]
/// queue nothing appends to it again (spec.md §3 invariant).
#[derive(Debug)]
pub struct Bucket {
    key: Vec<u8>,
    first_seen: f64,
    stream: Vec<u8>,
    /// Bytes of `stream` not yet consumed by the writer. Starts equal to
    /// `stream.len()` and only ever decreases.
    stream_len: usize,
    item_count: usize,
    healthy: bool,
    /// Keys into the ingress loop's idle/TTL `DelayQueue`s, set once by
    /// `Ingress` right after admission. Letting a timer expiry carry only
    /// key bytes (rather than a `Bucket` back-reference) is what keeps this
    /// struct free of any pointer back to the table that holds it
    /// (spec.md §9 "Bucket/Server cyclic reference"); these fields are the
    /// other half of that design, letting the expiry handler confirm the
    /// firing timer still belongs to the bucket it finds in the table.
    idle_timer_key: Option<TimerKey>,
    ttl_timer_key: Option<TimerKey>,
}

impl Bucket {
    /// Allocate a new bucket for `key`, writing the header line
    /// `"\n<now>;<key>"` (spec.md §3/§4.2). Does not arm timers or insert
    /// into any table; that is the caller's (`BucketTable::admit`'s)
    /// responsibility, keeping `Bucket` ignorant of the table that holds it.
    pub fn create(key: &[u8], now: f64) -> Result<Self, Error> {
        let mut stream = Vec::new();
        stream
            .try_reserve(INITIAL_STREAM_CAPACITY.max(key.len() + 32))
            .map_err(|_| Error::ResourceUnavailable)?;

        stream.push(b'\n');
        let mut header = String::new();
        let _ = write!(header, "{now};", now = now);
        stream.extend_from_slice(header.as_bytes());
        stream.extend_from_slice(key);

        let stream_len = stream.len();
        Ok(Self {
            key: key.to_vec(),
            first_seen: now,
            stream,
            stream_len,
            item_count: 0,
            healthy: true,
            idle_timer_key: None,
            ttl_timer_key: None,
        })
    }

    /// Record the `DelayQueue` keys `Ingress` armed for this bucket
    /// immediately after admission.
    pub fn set_timer_keys(&mut self, idle: TimerKey, ttl: TimerKey) {
        self.idle_timer_key = Some(idle);
        self.ttl_timer_key = Some(ttl);
    }

    #[must_use]
    pub fn idle_timer_key(&self) -> Option<TimerKey> {
        self.idle_timer_key
    }

    #[must_use]
    pub fn ttl_timer_key(&self) -> Option<TimerKey> {
        self.ttl_timer_key
    }

    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    #[must_use]
    pub fn first_seen(&self) -> f64 {
        self.first_seen
    }

    #[must_use]
    pub fn item_count(&self) -> usize {
        self.item_count
    }

    #[must_use]
    pub fn healthy(&self) -> bool {
        self.healthy
    }

    /// Bytes still owed to the writer.
    #[must_use]
    pub fn stream_len(&self) -> usize {
        self.stream_len
    }

    /// The unconsumed tail of the stream buffer.
    #[must_use]
    pub fn pending_bytes(&self) -> &[u8] {
        let start = self.stream.len() - self.stream_len;
        &self.stream[start..]
    }

    /// Mark `n` bytes at the front of [`Self::pending_bytes`] as written.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.stream_len);
        self.stream_len -= n;
    }

    /// Append `value_bytes` (already carrying its leading `;`) to the
    /// stream. Returns `Err` only if growing the buffer fails, in which
    /// case the caller must flush with [`FlushReason::SysError`]
    /// immediately (spec.md §4.2, §7 `AppendIOError`).
    pub fn append(&mut self, value_bytes: &[u8]) -> Result<(), Error> {
        if self.stream.try_reserve(value_bytes.len()).is_err() {
            self.healthy = false;
            return Err(Error::ResourceUnavailable);
        }
        self.stream.extend_from_slice(value_bytes);
        self.stream_len += value_bytes.len();
        self.item_count += 1;
        Ok(())
    }

    /// Whether this bucket has reached its configured size cap and must be
    /// flushed with [`FlushReason::MaxSize`].
    #[must_use]
    pub fn at_capacity(&self, max_bucket_size: usize) -> bool {
        self.item_count >= max_bucket_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_writes_header_line() {
        let b = Bucket::create(b"a", 5.0).expect("alloc ok");
        assert_eq!(b.pending_bytes(), b"\n5;a");
        assert_eq!(b.item_count(), 0);
        assert!(b.healthy());
    }

    #[test]
    fn append_grows_stream_and_counts_item() {
        let mut b = Bucket::create(b"a", 0.0).expect("alloc ok");
        b.append(b";x").expect("append ok");
        b.append(b";y").expect("append ok");
        assert_eq!(b.pending_bytes(), b"\n0;a;x;y");
        assert_eq!(b.item_count(), 2);
    }

    #[test]
    fn empty_value_still_counts_as_an_item() {
        let mut b = Bucket::create(b"a", 0.0).expect("alloc ok");
        b.append(b";").expect("append ok");
        assert_eq!(b.item_count(), 1);
        assert_eq!(b.pending_bytes(), b"\n0;a;");
    }

    #[test]
    fn advance_consumes_from_the_front() {
        let mut b = Bucket::create(b"a", 0.0).expect("alloc ok");
        b.append(b";x").expect("append ok");
        let total = b.stream_len();
        b.advance(3);
        assert_eq!(b.stream_len(), total - 3);
        assert_eq!(b.pending_bytes(), &b"\n0;a;x"[3..]);
    }

    #[test]
    fn at_capacity_reports_size_cap() {
        let mut b = Bucket::create(b"a", 0.0).expect("alloc ok");
        for _ in 0..3 {
            b.append(b";x").expect("append ok");
        }
        assert!(!b.at_capacity(4));
        b.append(b";x").expect("append ok");
        assert!(b.at_capacity(4));
    }
}
