//! Forktrail - process tree tracer with Chrome Trace Event output
//!
//! This library turns kernel process start/stop notifications into a
//! timeline that chrome://tracing and Perfetto can open: a lane allocator
//! keeps parent/child chains on one track, a tracker filters and correlates
//! events, and a background writer streams the JSON document to disk.

pub mod cli;
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod lanes;
pub mod proc_connector;
pub mod procfs;
pub mod record;
pub mod source;
pub mod tracker;
pub mod writer;
