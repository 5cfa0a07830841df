//! Kernel event source interface
//!
//! The tracker only sees [`ProcessEvent`]s handed to a single sink closure.
//! How they are produced (netlink, a channel, anything else) stays behind the
//! [`EventSource`] / [`EventSession`] pair.

use crate::error::Result;
use crate::event::ProcessEvent;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How often a pump must look at its stop flag
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A provider of process lifecycle sessions
pub trait EventSource: Send + Sync {
    /// Whether the caller holds the privilege sessions require
    fn is_elevated(&self) -> bool;

    /// Open a named session subscribed to process start/stop
    fn open(&self, session_name: &str) -> Result<Box<dyn EventSession>>;
}

/// A live subscription; tracing ends when it is dropped
pub trait EventSession: Send {
    /// Deliver events to `sink` until `stop` is set or the source fails
    fn pump(&mut self, stop: &AtomicBool, sink: &mut dyn FnMut(ProcessEvent)) -> Result<()>;
}

/// Source fed from a channel of already-decoded events
///
/// The session ends when `stop` is set or every sender is dropped.
#[derive(Debug, Clone)]
pub struct ChannelSource {
    events: Receiver<ProcessEvent>,
    elevated: bool,
}

impl ChannelSource {
    pub fn new(events: Receiver<ProcessEvent>) -> Self {
        Self {
            events,
            elevated: true,
        }
    }

    /// Report the caller as (un)privileged
    pub fn with_elevated(mut self, elevated: bool) -> Self {
        self.elevated = elevated;
        self
    }
}

impl EventSource for ChannelSource {
    fn is_elevated(&self) -> bool {
        self.elevated
    }

    fn open(&self, session_name: &str) -> Result<Box<dyn EventSession>> {
        tracing::debug!(session = session_name, "opening channel session");
        Ok(Box::new(ChannelSession {
            events: self.events.clone(),
        }))
    }
}

struct ChannelSession {
    events: Receiver<ProcessEvent>,
}

impl EventSession for ChannelSession {
    fn pump(&mut self, stop: &AtomicBool, sink: &mut dyn FnMut(ProcessEvent)) -> Result<()> {
        while !stop.load(Ordering::Acquire) {
            match self.events.recv_timeout(STOP_POLL_INTERVAL) {
                Ok(event) => sink(event),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(())
    }
}
