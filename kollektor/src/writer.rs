//! §4.4 `Writer`: the dedicated consumer thread that serializes closed
//! buckets into hour-rotated CSV files.
//!
//! Classic lock+condvar consumer, matching spec.md §5's concurrency model:
//! `push` holds the mutex only across the enqueue, the consumer holds it
//! only to pop the head, and the (possibly blocking) file write happens
//! with the mutex released.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, warn};

use crate::bucket::Bucket;

/// Header written to a chunk file the first time it is created, per
/// spec.md §3/§6.
const HEADER_LINE: &[u8] = b"first_seen;key;values";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to open chunk file {0}: {1}")]
    Open(PathBuf, #[source] io::Error),
    #[error("failed to write chunk file {0}: {1}")]
    Write(PathBuf, #[source] io::Error),
}

struct Queue {
    buckets: VecDeque<Bucket>,
    shutdown: bool,
}

/// Handle used by the ingress side to hand off closed buckets. Cloning is
/// cheap (an `Arc` bump) so the ingress loop can hold one for the lifetime
/// of the process.
#[derive(Clone)]
pub struct WriterHandle {
    inner: Arc<(Mutex<Queue>, Condvar)>,
}

impl WriterHandle {
    /// Enqueue `bucket` for the writer thread and wake it.
    pub fn push(&self, bucket: Bucket) {
        let (lock, cvar) = &*self.inner;
        {
            let mut queue = lock.lock().expect("writer queue mutex poisoned");
            queue.buckets.push_back(bucket);
        }
        cvar.notify_one();
    }

    /// Ask the writer thread to stop once its queue drains, and wake it so
    /// it notices.
    pub fn stop(&self) {
        let (lock, cvar) = &*self.inner;
        {
            let mut queue = lock.lock().expect("writer queue mutex poisoned");
            queue.shutdown = true;
        }
        cvar.notify_all();
    }

    #[cfg(test)]
    fn queue_len(&self) -> usize {
        let (lock, _cvar) = &*self.inner;
        lock.lock().expect("writer queue mutex poisoned").buckets.len()
    }
}

/// The writer thread handle: a [`WriterHandle`] for pushing/stopping plus
/// the `JoinHandle` to wait for clean exit.
pub struct Writer {
    handle: WriterHandle,
    join_handle: Option<JoinHandle<()>>,
}

impl Writer {
    /// Spawn the consumer thread. `storage_path` is the directory chunk
    /// files are written into (spec.md §3 "Chunk file").
    pub fn spawn(storage_path: PathBuf) -> Self {
        let inner = Arc::new((
            Mutex::new(Queue {
                buckets: VecDeque::new(),
                shutdown: false,
            }),
            Condvar::new(),
        ));
        let handle = WriterHandle {
            inner: Arc::clone(&inner),
        };

        let join_handle = thread::Builder::new()
            .name("kollektor-writer".into())
            .spawn(move || consumer_loop(inner, storage_path))
            .expect("failed to spawn writer thread");

        Self {
            handle,
            join_handle: Some(join_handle),
        }
    }

    #[must_use]
    pub fn handle(&self) -> WriterHandle {
        self.handle.clone()
    }

    /// Stop the consumer and block until it exits (spec.md §4.4 `stop` +
    /// `join`).
    pub fn join(mut self) {
        self.handle.stop();
        if let Some(jh) = self.join_handle.take() {
            let _ = jh.join();
        }
    }
}

fn consumer_loop(inner: Arc<(Mutex<Queue>, Condvar)>, storage_path: PathBuf) {
    let (lock, cvar) = &*inner;
    let mut rotation = Rotation::new(storage_path);

    loop {
        let mut queue = lock.lock().expect("writer queue mutex poisoned");
        while queue.buckets.is_empty() && !queue.shutdown {
            queue = cvar.wait(queue).expect("writer queue mutex poisoned");
        }
        if queue.buckets.is_empty() && queue.shutdown {
            return;
        }
        drop(queue);

        if let DrainOutcome::Blocked = drain_cycle(lock, &mut rotation) {
            // The bucket now at the head failed to rotate into an open
            // chunk file and was requeued untouched. Spec.md §4.4: "skip
            // this drain cycle; the bucket remains at the head of the
            // queue and will be retried on the next wake" — so block on
            // the condvar here instead of looping straight back into
            // `drain_cycle` and re-attempting `ensure_open` with no wait,
            // which would peg the CPU for as long as the open keeps
            // failing (e.g. the storage directory was removed).
            let queue = lock.lock().expect("writer queue mutex poisoned");
            let _ = cvar.wait(queue).expect("writer queue mutex poisoned");
        }
    }
}

/// Drain every bucket currently queued, per spec.md §4.4's consumer loop.
///
/// The mutex is held only to pop the head bucket off the queue; the
/// (possibly blocking) file write happens with it released, per spec.md §5
/// "Handoff discipline". Since a bucket is never observed by any other
/// thread once popped, taking it out of the queue and writing it to
/// completion before moving to the next is equivalent to, and simpler than,
/// repeatedly re-locking to re-inspect the front of the queue.
fn drain_cycle(lock: &Mutex<Queue>, rotation: &mut Rotation) -> DrainOutcome {
    loop {
        let mut bucket = {
            let mut queue = lock.lock().expect("writer queue mutex poisoned");
            match queue.buckets.pop_front() {
                Some(b) => b,
                None => return DrainOutcome::Drained,
            }
        };

        if let Err(e) = rotation.ensure_open(current_chunk_id()) {
            warn!("chunk rotation failed, retrying next wake: {e}");
            let mut queue = lock.lock().expect("writer queue mutex poisoned");
            queue.buckets.push_front(bucket);
            return DrainOutcome::Blocked;
        }

        match rotation.write_pending(&mut bucket) {
            WriteOutcome::Done => {}
            WriteOutcome::Failed => {
                // spec.md §7 `OutputWriteError`: log and discard, no
                // counter — `kills_syserr` belongs to the bucket-append
                // path's `AppendIOError`, not this one.
                error!(key = ?String::from_utf8_lossy(bucket.key()), "discarding bucket after write failure");
            }
        }
    }
}

enum WriteOutcome {
    /// Bucket fully flushed; pop and destroy it.
    Done,
    /// Write failed or returned zero bytes; discard without requeue.
    Failed,
}

enum DrainOutcome {
    /// The queue was drained until empty.
    Drained,
    /// A chunk-rotation open failed; the bucket that couldn't be rotated
    /// into a file is back at the head of the queue, untouched.
    Blocked,
}

struct Rotation {
    storage_path: PathBuf,
    file: Option<File>,
    current_chunk_id: Option<u64>,
}

impl Rotation {
    fn new(storage_path: PathBuf) -> Self {
        Self {
            storage_path,
            file: None,
            current_chunk_id: None,
        }
    }

    fn chunk_path(&self, chunk_id: u64) -> PathBuf {
        self.storage_path.join(format!("{chunk_id}.csv"))
    }

    /// Ensure `self.file` points at the chunk file for `chunk_id`, opening
    /// and writing the header line if needed (spec.md §3, §4.4 "Rotation").
    /// Takes `chunk_id` rather than reading the clock itself so rotation
    /// across an hour boundary is testable without waiting on the real
    /// clock.
    fn ensure_open(&mut self, chunk_id: u64) -> Result<(), Error> {
        if self.file.is_some() && self.current_chunk_id == Some(chunk_id) {
            return Ok(());
        }

        self.file = None;
        let path = self.chunk_path(chunk_id);
        let existed_with_bytes = path.metadata().map(|m| m.len() > 0).unwrap_or(false);

        let mut file = open_for_append(&path).map_err(|e| Error::Open(path.clone(), e))?;
        file.seek(SeekFrom::End(0))
            .map_err(|e| Error::Open(path.clone(), e))?;

        if !existed_with_bytes {
            file.write_all(HEADER_LINE)
                .map_err(|e| Error::Write(path.clone(), e))?;
        }

        debug!(chunk_id, path = %path.display(), "opened chunk file");
        self.file = Some(file);
        self.current_chunk_id = Some(chunk_id);
        Ok(())
    }

    /// Stream as many of `bucket`'s pending bytes as the OS accepts in one
    /// call, retrying on partial writes, per spec.md §4.4 "Streaming write".
    fn write_pending(&mut self, bucket: &mut Bucket) -> WriteOutcome {
        let file = self.file.as_mut().expect("ensure_open called first");
        loop {
            if bucket.stream_len() == 0 {
                return WriteOutcome::Done;
            }
            match file.write(bucket.pending_bytes()) {
                Ok(0) => return WriteOutcome::Failed,
                Ok(n) => {
                    bucket.advance(n);
                    if bucket.stream_len() == 0 {
                        return WriteOutcome::Done;
                    }
                    // Partial transfer: loop again immediately.
                }
                Err(e) => {
                    error!("chunk write failed: {e}");
                    return WriteOutcome::Failed;
                }
            }
        }
    }
}

fn open_for_append(path: &Path) -> io::Result<File> {
    // Deliberately `O_WRONLY | O_CREAT` without `O_APPEND`, then an explicit
    // seek to end — matching the original implementation (spec.md §9
    // "Open questions"). This is safe only under the single-writer
    // invariant documented there: concurrent writers to the same
    // `storage_path` would corrupt a chunk file.
    OpenOptions::new().write(true).create(true).open(path)
}

fn current_chunk_id() -> u64 {
    (crate::bucket::now_seconds() / 3600.0).floor() as u64
}
