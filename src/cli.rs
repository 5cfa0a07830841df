//! CLI argument parsing for Forktrail

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "forktrail")]
#[command(version)]
#[command(
    about = "Trace a process tree into a Chrome Trace Event timeline",
    long_about = None
)]
pub struct Cli {
    /// File to write the trace to (default: forktrail_trace_<millis>.json)
    #[arg(short = 'o', long = "outfile", value_name = "FILE")]
    pub outfile: Option<PathBuf>,

    /// Process names to watch (substring, case-insensitive; repeatable)
    #[arg(short = 'w', long = "watch", value_name = "NAME")]
    pub watch: Vec<String>,

    /// Kernel session name
    #[arg(long = "session", value_name = "NAME")]
    pub session: Option<String>,

    /// TOML configuration file
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Emit one complete span per process instead of begin/end pairs
    #[arg(long = "complete")]
    pub complete: bool,

    /// Only trace descendants of forktrail itself (plus --watch matches)
    #[arg(long = "tree")]
    pub tree: bool,

    /// Enable debug logging to stderr
    #[arg(long = "debug")]
    pub debug: bool,

    /// Command to run (everything after --); without one, trace until Ctrl-C
    #[arg(last = true)]
    pub command: Option<Vec<String>>,
}
