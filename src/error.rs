//! Error types for process tracking and trace writing
//!
//! Fatal errors abort `Processes::watch`; the lane and shutdown variants are
//! only ever formatted into log lines so one bad record never costs the rest
//! of the trace.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the tracker, the event sources and the writer
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Tracing requires elevated privileges: {0}")]
    Permission(String),

    #[error("Session already started: {0}")]
    SessionConflict(String),

    #[error("Kernel event source failed: {0}")]
    Subsystem(String),

    #[error("No lane recorded for stopped process {pid}")]
    InconsistentLane { pid: i32 },

    #[error("Writer did not finish within {timeout:?}; trace file may be incomplete")]
    ShutdownTimeout { timeout: Duration },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for tracing operations
pub type Result<T> = std::result::Result<T, TraceError>;

impl TraceError {
    /// Whether the error should end a watch session
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TraceError::InconsistentLane { .. } | TraceError::ShutdownTimeout { .. }
        )
    }
}
