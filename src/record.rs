//! Trace records in Chrome Trace Event format
//!
//! Records are a closed set of four phases sharing one serializer. Field order
//! is fixed to match what trace viewers expect:
//!
//! ```text
//! Instant:  {"name":..,"ts":..,"ph":"i","s":"g"}
//! Begin:    {"pid":..,"tid":..,"ts":..,"ph":"B","name":..,"args":{..}}
//! Complete: {"pid":..,"tid":..,"ts":..,"dur":..,"ph":"X","name":..,"args":{..}}
//! End:      {"pid":..,"tid":..,"ts":..,"ph":"E","args":{..}}
//! ```
//!
//! Timestamps and durations are microseconds since the watch started.

use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};

/// Sentinel for "no process" / "no lane"
pub const NONE: i32 = -1;

/// Ordered key/value attributes attached to a record
///
/// Insertion order is preserved and duplicate keys are kept; both entries are
/// emitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args(Vec<(String, String)>);

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    /// First value stored under `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Args {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for Args {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Chrome trace phase of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Instant,
    Begin,
    Complete,
    End,
}

impl Phase {
    /// The `ph` code written to the trace
    pub fn code(self) -> &'static str {
        match self {
            Phase::Instant => "i",
            Phase::Begin => "B",
            Phase::Complete => "X",
            Phase::End => "E",
        }
    }
}

/// One timestamped fact about a process lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum TraceRecord {
    /// Global instant mark
    Instant { name: String, ts: f64 },
    /// Start of a process span
    Begin {
        pid: i32,
        tid: i32,
        ts: f64,
        name: String,
        args: Args,
    },
    /// Whole process span, emitted once the process has stopped
    Complete {
        pid: i32,
        tid: i32,
        ts: f64,
        dur: f64,
        name: String,
        args: Args,
    },
    /// End of a process span
    End {
        pid: i32,
        tid: i32,
        ts: f64,
        args: Args,
    },
}

impl TraceRecord {
    pub fn instant(name: impl Into<String>, ts: f64) -> Self {
        TraceRecord::Instant {
            name: name.into(),
            ts,
        }
    }

    pub fn begin(pid: i32, tid: i32, ts: f64, name: impl Into<String>, args: Args) -> Self {
        TraceRecord::Begin {
            pid,
            tid,
            ts,
            name: name.into(),
            args,
        }
    }

    /// Complete span; a negative duration is clamped to zero
    pub fn complete(
        pid: i32,
        tid: i32,
        ts: f64,
        dur: f64,
        name: impl Into<String>,
        args: Args,
    ) -> Self {
        TraceRecord::Complete {
            pid,
            tid,
            ts,
            dur: dur.max(0.0),
            name: name.into(),
            args,
        }
    }

    pub fn end(pid: i32, tid: i32, ts: f64, args: Args) -> Self {
        TraceRecord::End { pid, tid, ts, args }
    }

    pub fn phase(&self) -> Phase {
        match self {
            TraceRecord::Instant { .. } => Phase::Instant,
            TraceRecord::Begin { .. } => Phase::Begin,
            TraceRecord::Complete { .. } => Phase::Complete,
            TraceRecord::End { .. } => Phase::End,
        }
    }

    pub fn timestamp(&self) -> f64 {
        match self {
            TraceRecord::Instant { ts, .. }
            | TraceRecord::Begin { ts, .. }
            | TraceRecord::Complete { ts, .. }
            | TraceRecord::End { ts, .. } => *ts,
        }
    }

    /// Lane of a process record; `None` for instants
    pub fn lane(&self) -> Option<i32> {
        match self {
            TraceRecord::Instant { .. } => None,
            TraceRecord::Begin { tid, .. }
            | TraceRecord::Complete { tid, .. }
            | TraceRecord::End { tid, .. } => Some(*tid),
        }
    }

    pub fn args(&self) -> Option<&Args> {
        match self {
            TraceRecord::Instant { .. } => None,
            TraceRecord::Begin { args, .. }
            | TraceRecord::Complete { args, .. }
            | TraceRecord::End { args, .. } => Some(args),
        }
    }

    /// Serialize to a single-line JSON object
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl Serialize for TraceRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let ph = self.phase().code();
        match self {
            TraceRecord::Instant { name, ts } => {
                let mut s = serializer.serialize_struct("Instant", 4)?;
                s.serialize_field("name", name)?;
                s.serialize_field("ts", ts)?;
                s.serialize_field("ph", ph)?;
                s.serialize_field("s", "g")?;
                s.end()
            }
            TraceRecord::Begin {
                pid,
                tid,
                ts,
                name,
                args,
            } => {
                let mut s = serializer.serialize_struct("Begin", 6)?;
                s.serialize_field("pid", pid)?;
                s.serialize_field("tid", tid)?;
                s.serialize_field("ts", ts)?;
                s.serialize_field("ph", ph)?;
                s.serialize_field("name", name)?;
                s.serialize_field("args", args)?;
                s.end()
            }
            TraceRecord::Complete {
                pid,
                tid,
                ts,
                dur,
                name,
                args,
            } => {
                let mut s = serializer.serialize_struct("Complete", 7)?;
                s.serialize_field("pid", pid)?;
                s.serialize_field("tid", tid)?;
                s.serialize_field("ts", ts)?;
                s.serialize_field("dur", dur)?;
                s.serialize_field("ph", ph)?;
                s.serialize_field("name", name)?;
                s.serialize_field("args", args)?;
                s.end()
            }
            TraceRecord::End { pid, tid, ts, args } => {
                let mut s = serializer.serialize_struct("End", 5)?;
                s.serialize_field("pid", pid)?;
                s.serialize_field("tid", tid)?;
                s.serialize_field("ts", ts)?;
                s.serialize_field("ph", ph)?;
                s.serialize_field("args", args)?;
                s.end()
            }
        }
    }
}
