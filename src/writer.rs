//! Streaming trace writer
//!
//! Decouples the event pump (hot path) from disk I/O (cold path):
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ EVENT PUMP                                   │
//! │   add_entry(record) → queue.push()           │
//! │   lock-free, never waits on the file         │
//! └──────────────────────────────────────────────┘
//!                      │ unbounded SegQueue
//!                      ▼
//! ┌──────────────────────────────────────────────┐
//! │ FLUSH THREAD                                 │
//! │   every flush_interval: drain queue → file   │
//! │   on close: final drain, metadata, `}`       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The file is a JSON object whose `traceEvents` array grows while tracing.
//! A comma is written *before* every record once any record bytes have reached
//! the file, so the array never ends in a trailing comma. The closing sequence (array close, metadata,
//! brace) is attempted on every shutdown path, including a panic in the loop.

use crate::config::WriterConfig;
use crate::error::{Result, TraceError};
use crate::record::TraceRecord;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use crossbeam::queue::SegQueue;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

type Sink = Box<dyn Write + Send>;

/// State shared between the writer handle and its flush thread
struct Shared {
    queue: SegQueue<TraceRecord>,
    meta: Mutex<Vec<(String, String)>>,
    meta_sealed: AtomicBool,
    /// Taken (set to None) once the document is finished or force-closed
    sink: Mutex<Option<Sink>>,
    written: AtomicU64,
    /// Set once any record bytes reached the sink, even from a failed write
    needs_separator: AtomicBool,
    /// Set when `close` timed out; nothing more is written after that
    abandoned: AtomicBool,
}

impl Shared {
    fn sink(&self) -> std::sync::MutexGuard<'_, Option<Sink>> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Background JSON writer for trace records
///
/// # Example
///
/// ```no_run
/// use forktrail::record::TraceRecord;
/// use forktrail::writer::Writer;
///
/// let writer = Writer::create("trace.json")?;
/// writer.add_meta("forktrail.machine", "build-01");
/// writer.add_entry(TraceRecord::instant("checkpoint", 0.0));
/// writer.close();
/// # Ok::<(), forktrail::error::TraceError>(())
/// ```
pub struct Writer {
    shared: Arc<Shared>,
    config: WriterConfig,
    stop_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Writer {
    /// Create `path` and start flushing with the default cadence
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::create_with_config(path, WriterConfig::default())
    }

    pub fn create_with_config(path: impl AsRef<Path>, config: WriterConfig) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), "opened trace file");
        Ok(Self::from_sink(BufWriter::new(file), config))
    }

    /// Write to an arbitrary sink instead of a file
    pub fn from_sink(sink: impl Write + Send + 'static, config: WriterConfig) -> Self {
        let shared = Arc::new(Shared {
            queue: SegQueue::new(),
            meta: Mutex::new(Vec::new()),
            meta_sealed: AtomicBool::new(false),
            sink: Mutex::new(Some(Box::new(sink))),
            written: AtomicU64::new(0),
            needs_separator: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
        });

        let (stop_tx, stop_rx) = channel::bounded(1);
        let (done_tx, done_rx) = channel::bounded(1);

        let worker_shared = shared.clone();
        let interval = config.flush_interval;
        let handle = thread::Builder::new()
            .name("forktrail-writer".to_string())
            .spawn(move || {
                flush_loop(&worker_shared, &stop_rx, interval);
                let _ = done_tx.send(());
            });

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                // No thread: records stay queued and close() reports a timeout
                tracing::error!("failed to spawn writer thread: {}", e);
                None
            }
        };

        Self {
            shared,
            config,
            stop_tx: Mutex::new(Some(stop_tx)),
            done_rx,
            handle: Mutex::new(handle),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a record for writing; never blocks
    pub fn add_entry(&self, record: TraceRecord) {
        if self.closed.load(Ordering::Acquire) {
            tracing::debug!(phase = ?record.phase(), "record dropped after close");
            return;
        }
        self.shared.queue.push(record);
    }

    /// Add a top-level metadata value; a repeated key accumulates as `a,b`
    pub fn add_meta(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        let mut meta = self
            .shared
            .meta
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if self.shared.meta_sealed.load(Ordering::Acquire) {
            tracing::debug!(key = %key, "metadata ignored after document was finished");
            return;
        }

        match meta.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => {
                existing.push(',');
                existing.push_str(&value);
            }
            None => meta.push((key, value)),
        }
    }

    /// Current metadata value for `key`
    pub fn meta(&self, key: &str) -> Option<String> {
        self.shared
            .meta
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Records serialized to the sink so far
    pub fn written(&self) -> u64 {
        self.shared.written.load(Ordering::Relaxed)
    }

    /// Records queued but not yet serialized
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Stop the flush thread and finish the document
    ///
    /// Waits up to `shutdown_timeout`. On timeout the sink is dropped if it
    /// is not mid-write; otherwise the writer thread drops it as soon as the
    /// write returns. Queued records are discarded and no footer is written.
    /// Calling close again is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Dropping the sender wakes the loop immediately
        self.stop_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match self.done_rx.recv_timeout(self.config.shutdown_timeout) {
            Ok(()) => {
                if let Some(handle) = handle {
                    if handle.join().is_err() {
                        tracing::error!("writer thread panicked");
                    }
                }
                tracing::debug!(records = self.written(), "trace document closed");
            }
            Err(_) => {
                let err = TraceError::ShutdownTimeout {
                    timeout: self.config.shutdown_timeout,
                };
                tracing::error!("{}", err);
                self.shared.abandoned.store(true, Ordering::Release);
                self.force_close();
            }
        }
    }

    fn force_close(&self) {
        match self.shared.sink.try_lock() {
            Ok(mut sink) => {
                if let Some(mut sink) = sink.take() {
                    let _ = sink.flush();
                }
            }
            Err(_) => tracing::error!("trace file busy; leaving it to the writer thread"),
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Writes the closing sequence when dropped, so it also runs on unwind
struct FinishGuard<'a> {
    shared: &'a Shared,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        finish_document(self.shared);
    }
}

fn flush_loop(shared: &Shared, stop_rx: &Receiver<()>, interval: std::time::Duration) {
    let _finish = FinishGuard { shared };

    if let Some(sink) = shared.sink().as_mut() {
        if let Err(e) = sink.write_all(b"{\n\"traceEvents\": [\n") {
            tracing::error!("failed to write trace header: {}", e);
        }
    }

    loop {
        drain(shared);
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Records queued between the last tick and the stop signal
    drain(shared);
}

/// Write every queued record; returns how many were written
fn drain(shared: &Shared) -> usize {
    let mut guard = shared.sink();

    if shared.abandoned.load(Ordering::Acquire) {
        let mut dropped = 0usize;
        while shared.queue.pop().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::warn!(dropped, "discarding records after shutdown timeout");
        }
        return 0;
    }

    let Some(sink) = guard.as_mut() else {
        return 0;
    };

    let mut count = 0;
    while let Some(record) = shared.queue.pop() {
        let bytes = match serde_json::to_vec(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("skipping unserializable record: {}", e);
                continue;
            }
        };

        let mut frame = Vec::with_capacity(bytes.len() + 2);
        if shared.needs_separator.load(Ordering::Relaxed) {
            frame.extend_from_slice(b",\n");
        }
        frame.extend_from_slice(&bytes);

        let (sent, result) = write_counted(sink.as_mut(), &frame);
        if sent > 0 {
            shared.needs_separator.store(true, Ordering::Relaxed);
        }
        match result {
            Ok(()) => {
                shared.written.fetch_add(1, Ordering::Relaxed);
                count += 1;
            }
            Err(e) => tracing::error!(sent, "failed to write trace record: {}", e),
        }
    }

    if count > 0 {
        if let Err(e) = sink.flush() {
            tracing::error!("failed to flush trace file: {}", e);
        }
        tracing::trace!(count, "flushed trace records");
    }
    count
}

/// `write_all` that also reports how many bytes made it out before an error
fn write_counted(sink: &mut dyn Write, mut buf: &[u8]) -> (usize, std::io::Result<()>) {
    let mut sent = 0;
    while !buf.is_empty() {
        match sink.write(buf) {
            Ok(0) => {
                return (
                    sent,
                    Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "sink accepted no bytes",
                    )),
                )
            }
            Ok(n) => {
                sent += n;
                buf = &buf[n..];
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return (sent, Err(e)),
        }
    }
    (sent, Ok(()))
}

fn finish_document(shared: &Shared) {
    let meta = {
        let meta = shared.meta.lock().unwrap_or_else(PoisonError::into_inner);
        shared.meta_sealed.store(true, Ordering::Release);
        meta.clone()
    };

    let Some(mut sink) = shared.sink().take() else {
        return;
    };
    if shared.abandoned.load(Ordering::Acquire) {
        return;
    }

    let mut tail = String::from("\n]");
    for (key, value) in &meta {
        let key = serde_json::to_string(key).unwrap_or_else(|_| "\"\"".to_string());
        let value = serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string());
        tail.push_str(",\n");
        tail.push_str(&key);
        tail.push_str(": ");
        tail.push_str(&value);
    }
    tail.push_str("\n}\n");

    if let Err(e) = sink.write_all(tail.as_bytes()).and_then(|()| sink.flush()) {
        tracing::error!("failed to finish trace document: {}", e);
    }
}
