//! Process lifecycle notifications delivered by an event source

use crate::record::{Args, NONE};

/// Payload fields copied into record args, in emission order
pub const ARG_FIELDS: &[&str] = &[
    "CommandLine",
    "PackageFullName",
    "ImageFileName",
    "ProcessID",
    "SessionID",
    "ExitStatus",
    "ParentID",
    "ParentProcessID",
];

/// Payload fields that may carry the parent process id
const PARENT_FIELDS: &[&str] = &["ParentID", "ParentProcessID"];

/// Data common to start and stop notifications
#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    pub pid: i32,
    /// Display name (e.g. `make`)
    pub name: String,
    /// Milliseconds since the session started
    pub timestamp_ms: f64,
    /// Named string payload fields, in source order
    pub payload: Vec<(String, String)>,
}

impl EventData {
    pub fn new(pid: i32, name: impl Into<String>, timestamp_ms: f64) -> Self {
        Self {
            pid,
            name: name.into(),
            timestamp_ms,
            payload: Vec::new(),
        }
    }

    /// Builder-style payload field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.push((key.into(), value.into()));
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.payload
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Parent id from the payload, `NONE` if absent or unparseable
    pub fn parent_id(&self) -> i32 {
        PARENT_FIELDS
            .iter()
            .filter_map(|key| self.field(key))
            .find_map(|value| value.trim().parse::<i32>().ok())
            .unwrap_or(NONE)
    }

    /// Microseconds since the session started
    pub fn timestamp_us(&self) -> f64 {
        self.timestamp_ms * 1000.0
    }

    /// Whitelisted payload fields as record args; other fields are dropped
    pub fn args(&self) -> Args {
        self.payload
            .iter()
            .filter(|(key, _)| ARG_FIELDS.contains(&key.as_str()))
            .cloned()
            .collect()
    }
}

/// A kernel process lifecycle notification
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Started(EventData),
    Stopped(EventData),
}

impl ProcessEvent {
    pub fn data(&self) -> &EventData {
        match self {
            ProcessEvent::Started(data) | ProcessEvent::Stopped(data) => data,
        }
    }
}
