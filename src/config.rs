//! Configuration for the writer, the tracker and the optional TOML file
//!
//! Everything is passed explicitly into constructors; nothing here is global.
//!
//! # Example file
//!
//! ```toml
//! session_name = "nightly-build"
//! watch = ["cargo", "rustc"]
//! output = "build.json"
//! flush_interval = "250ms"
//! shutdown_timeout = "10s"
//! complete_spans = true
//! ```

use crate::error::{Result, TraceError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Writer cadence and shutdown bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    /// How often the background loop drains the queue
    pub flush_interval: Duration,
    /// How long `close` waits for the final drain
    pub shutdown_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// How process spans are written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordStyle {
    /// Begin on start, End on stop
    #[default]
    BeginEnd,
    /// One Complete record on stop; unfinished spans become Begin records
    Complete,
}

/// Tracker behaviour beyond the name filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackerConfig {
    pub style: RecordStyle,
    /// Track descendants of this process; an empty name filter then
    /// matches nothing instead of everything
    pub root_pid: Option<i32>,
}

/// Optional settings loaded from `--config FILE`
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub session_name: Option<String>,
    #[serde(default)]
    pub watch: Vec<String>,
    pub output: Option<PathBuf>,
    pub flush_interval: Option<String>,
    pub shutdown_timeout: Option<String>,
    pub complete_spans: Option<bool>,
}

impl FileConfig {
    /// Load and parse a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| TraceError::Config(e.to_string()))
    }

    /// Writer settings with file values layered over the defaults
    pub fn writer_config(&self) -> Result<WriterConfig> {
        let mut config = WriterConfig::default();
        if let Some(interval) = &self.flush_interval {
            config.flush_interval = parse_duration("flush_interval", interval)?;
        }
        if let Some(timeout) = &self.shutdown_timeout {
            config.shutdown_timeout = parse_duration("shutdown_timeout", timeout)?;
        }
        if config.flush_interval.is_zero() {
            return Err(TraceError::Config(
                "flush_interval must be greater than zero".to_string(),
            ));
        }
        Ok(config)
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| TraceError::Config(format!("{}: {} ({})", field, e, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_defaults() {
        let config = WriterConfig::default();
        assert_eq!(config.flush_interval, Duration::from_millis(100));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_tracker_defaults() {
        let config = TrackerConfig::default();
        assert_eq!(config.style, RecordStyle::BeginEnd);
        assert_eq!(config.root_pid, None);
    }

    #[test]
    fn test_parse_full_file() {
        let config = FileConfig::parse(
            r#"
            session_name = "nightly"
            watch = ["cargo", "rustc"]
            output = "out.json"
            flush_interval = "250ms"
            shutdown_timeout = "10s"
            complete_spans = true
            "#,
        )
        .unwrap();

        assert_eq!(config.session_name.as_deref(), Some("nightly"));
        assert_eq!(config.watch, vec!["cargo", "rustc"]);
        assert_eq!(config.output, Some(PathBuf::from("out.json")));
        assert_eq!(config.complete_spans, Some(true));

        let writer = config.writer_config().unwrap();
        assert_eq!(writer.flush_interval, Duration::from_millis(250));
        assert_eq!(writer.shutdown_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_parse_empty_file() {
        let config = FileConfig::parse("").unwrap();
        assert_eq!(config, FileConfig::default());
        assert_eq!(config.writer_config().unwrap(), WriterConfig::default());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = FileConfig::parse("colour = \"red\"");
        assert!(matches!(result, Err(TraceError::Config(_))));
    }

    #[test]
    fn test_bad_duration_rejected() {
        let config = FileConfig::parse("flush_interval = \"soon\"").unwrap();
        let err = config.writer_config().unwrap_err();
        assert!(err.to_string().contains("flush_interval"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = FileConfig::parse("flush_interval = \"0s\"").unwrap();
        assert!(config.writer_config().is_err());
    }
}
