//! Process tracker: kernel events in, trace records out
//!
//! Owns the lane table and the set of watched pids. A started process is
//! watched when its parent is already watched, when no name filters are set,
//! or when its name contains one of the filters (ignoring case). Stop events
//! for processes that are not watched are ignored, so every record pair stays
//! symmetric.
//!
//! `watch` occupies its caller until `stop_watching` is called or the event
//! source fails; run it on its own thread and share the tracker via `Arc`.

use crate::config::{RecordStyle, TrackerConfig};
use crate::error::{Result, TraceError};
use crate::event::{EventData, ProcessEvent};
use crate::filter::ProcessFilter;
use crate::lanes::LaneAllocator;
use crate::record::{Args, TraceRecord, NONE};
use crate::source::EventSource;
use crate::writer::Writer;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Lifecycle of the single watch session an instance may run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Active,
    Finished,
}

/// Shared between the tracker and its stop handles
#[derive(Debug)]
struct SessionControl {
    state: Mutex<SessionState>,
    stop: AtomicBool,
    /// Set while the event source is open and pumping
    tracing: AtomicBool,
}

impl SessionControl {
    fn request_stop(&self) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == SessionState::Active {
            self.stop.store(true, Ordering::Release);
        }
    }
}

/// Cloneable handle that ends an active watch (e.g. from a Ctrl-C handler)
#[derive(Debug, Clone)]
pub struct StopHandle {
    control: Arc<SessionControl>,
}

impl StopHandle {
    /// Same as [`Processes::stop_watching`]
    pub fn stop(&self) {
        self.control.request_stop();
    }
}

/// A span held back until its process stops (`RecordStyle::Complete`)
#[derive(Debug, Clone)]
struct PendingSpan {
    lane: i32,
    ts: f64,
    name: String,
    args: Args,
}

/// Converts process start/stop events into trace records
pub struct Processes<S: EventSource> {
    source: S,
    writer: Arc<Writer>,
    config: TrackerConfig,
    filter: RwLock<ProcessFilter>,
    lanes: LaneAllocator,
    watched: Mutex<HashSet<i32>>,
    pending: Mutex<HashMap<i32, PendingSpan>>,
    control: Arc<SessionControl>,
    /// Bits of the latest event timestamp (µs) seen
    last_ts: AtomicU64,
}

impl<S: EventSource> Processes<S> {
    pub fn new(source: S, writer: Arc<Writer>) -> Self {
        Self::with_config(source, writer, TrackerConfig::default())
    }

    pub fn with_config(source: S, writer: Arc<Writer>, config: TrackerConfig) -> Self {
        Self {
            source,
            writer,
            config,
            filter: RwLock::new(ProcessFilter::all()),
            lanes: LaneAllocator::new(),
            watched: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            control: Arc::new(SessionControl {
                state: Mutex::new(SessionState::Idle),
                stop: AtomicBool::new(false),
                tracing: AtomicBool::new(false),
            }),
            last_ts: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            control: self.control.clone(),
        }
    }

    /// Trace process starts and stops until stopped or the source fails
    ///
    /// # Errors
    ///
    /// - `Permission` when the source reports the caller is not elevated
    /// - `SessionConflict` when this instance has already watched
    /// - `Subsystem` when the source fails while pumping
    pub fn watch<T: AsRef<str>>(&self, session_name: &str, name_filters: &[T]) -> Result<()> {
        if !self.source.is_elevated() {
            return Err(TraceError::Permission(
                "process event tracing must run as root".to_string(),
            ));
        }

        {
            let mut state = self
                .control
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *state != SessionState::Idle {
                return Err(TraceError::SessionConflict(session_name.to_string()));
            }
            *state = SessionState::Active;
            self.control.stop.store(false, Ordering::Release);
        }

        let filter = ProcessFilter::from_names(name_filters);
        if filter.is_empty() {
            tracing::info!(session = session_name, "watching all processes");
        } else {
            tracing::info!(session = session_name, filters = ?filter.names(), "watching processes");
        }
        *self.filter.write().unwrap_or_else(PoisonError::into_inner) = filter;

        if let Some(root) = self.config.root_pid {
            self.watched_set().insert(root);
            tracing::debug!(root, "tracking descendants of root process");
        }

        let result = match self.source.open(session_name) {
            Ok(mut session) => {
                self.writer
                    .add_entry(TraceRecord::instant(format!("{} started", session_name), 0.0));
                self.control.tracing.store(true, Ordering::Release);
                let result = session.pump(&self.control.stop, &mut |event| self.ingest(event));
                self.control.tracing.store(false, Ordering::Release);
                drop(session);
                self.final_flush(session_name);
                result
            }
            Err(e) => Err(e),
        };

        *self
            .control
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = SessionState::Finished;

        if let Err(e) = &result {
            tracing::error!(session = session_name, "watch failed: {}", e);
        }
        result
    }

    /// End an active watch; a no-op when none is running
    pub fn stop_watching(&self) {
        self.control.request_stop();
    }

    /// Whether the event source is currently open and delivering
    pub fn is_tracing(&self) -> bool {
        self.control.tracing.load(Ordering::Acquire)
    }

    /// Apply one kernel notification
    pub fn ingest(&self, event: ProcessEvent) {
        match event {
            ProcessEvent::Started(data) => self.on_start(data),
            ProcessEvent::Stopped(data) => self.on_stop(data),
        }
    }

    /// Pids currently watched
    pub fn watched(&self) -> Vec<i32> {
        let mut pids: Vec<i32> = self.watched_set().iter().copied().collect();
        pids.sort_unstable();
        pids
    }

    pub fn is_watched(&self, pid: i32) -> bool {
        self.watched_set().contains(&pid)
    }

    fn watched_set(&self) -> std::sync::MutexGuard<'_, HashSet<i32>> {
        self.watched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn name_included(&self, name: &str) -> bool {
        let filter = self.filter.read().unwrap_or_else(PoisonError::into_inner);
        if self.config.root_pid.is_some() {
            filter.matches_explicit(name)
        } else {
            filter.matches(name)
        }
    }

    fn observe(&self, ts: f64) {
        let bits = ts.max(0.0).to_bits();
        self.last_ts.fetch_max(bits, Ordering::Relaxed);
    }

    fn last_timestamp(&self) -> f64 {
        f64::from_bits(self.last_ts.load(Ordering::Relaxed))
    }

    fn on_start(&self, data: EventData) {
        let parent = data.parent_id();
        let ts = data.timestamp_us();
        self.observe(ts);

        {
            let mut watched = self.watched_set();
            let included = watched.contains(&parent) || self.name_included(&data.name);
            if !included {
                tracing::trace!(pid = data.pid, name = %data.name, "ignoring process");
                return;
            }
            watched.insert(data.pid);
        }

        let lane = self.lanes.add_child(data.pid, parent);
        tracing::debug!(pid = data.pid, parent, lane, name = %data.name, "process started");

        let args = data.args();
        match self.config.style {
            RecordStyle::BeginEnd => {
                self.writer
                    .add_entry(TraceRecord::begin(NONE, lane, ts, data.name, args));
            }
            RecordStyle::Complete => {
                self.pending_spans().insert(
                    data.pid,
                    PendingSpan {
                        lane,
                        ts,
                        name: data.name,
                        args,
                    },
                );
            }
        }
    }

    fn on_stop(&self, data: EventData) {
        let ts = data.timestamp_us();
        self.observe(ts);

        if !self.watched_set().remove(&data.pid) {
            return;
        }

        let lane = match self.lanes.remove_child(data.pid) {
            Some(lane) => lane,
            None => {
                tracing::warn!("{}", TraceError::InconsistentLane { pid: data.pid });
                NONE
            }
        };
        tracing::debug!(pid = data.pid, lane, "process stopped");

        let args = data.args();
        let pending = match self.config.style {
            RecordStyle::BeginEnd => None,
            RecordStyle::Complete => self.pending_spans().remove(&data.pid),
        };

        let record = match pending {
            Some(span) => {
                let mut merged = span.args;
                for (key, value) in args.iter() {
                    if merged.get(key).is_none() {
                        merged.push(key, value);
                    }
                }
                TraceRecord::complete(NONE, lane, span.ts, ts - span.ts, span.name, merged)
            }
            None => TraceRecord::end(NONE, lane, ts, args),
        };
        self.writer.add_entry(record);
    }

    fn pending_spans(&self) -> std::sync::MutexGuard<'_, HashMap<i32, PendingSpan>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget all live processes once the session has ended
    fn final_flush(&self, session_name: &str) {
        let unterminated = {
            let mut watched = self.watched_set();
            let count = watched.len();
            watched.clear();
            count
        };
        self.lanes.clear();

        let mut pending: Vec<PendingSpan> = self
            .pending_spans()
            .drain()
            .map(|(_, span)| span)
            .collect();
        pending.sort_by(|a, b| a.ts.total_cmp(&b.ts));
        for span in pending {
            self.writer.add_entry(TraceRecord::begin(
                NONE, span.lane, span.ts, span.name, span.args,
            ));
        }

        self.writer.add_entry(TraceRecord::instant(
            format!("{} stopped", session_name),
            self.last_timestamp(),
        ));
        tracing::info!(
            session = session_name,
            unterminated,
            "watch finished"
        );
    }
}

impl<S: EventSource> Drop for Processes<S> {
    fn drop(&mut self) {
        self.stop_watching();
    }
}
