use anyhow::{Context, Result};
use clap::Parser;
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use forktrail::cli::Cli;
use forktrail::config::{FileConfig, RecordStyle, TrackerConfig};
use forktrail::proc_connector::ProcConnector;
use forktrail::source::EventSource;
use forktrail::tracker::Processes;
use forktrail::writer::Writer;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitCode, ExitStatus};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

const DEFAULT_SESSION: &str = "forktrail";
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const WAIT_TICK: Duration = Duration::from_millis(100);
/// How long an interrupted command gets to exit on its own
const INTERRUPT_GRACE: Duration = Duration::from_secs(5);

/// Initialize tracing subscriber; --debug raises everything to TRACE
fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let filter = if debug {
        filter.add_directive(tracing::Level::TRACE.into())
    } else {
        filter
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn default_output() -> PathBuf {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    PathBuf::from(format!("forktrail_trace_{}.json", millis))
}

fn now_rfc3339() -> String {
    humantime::format_rfc3339_millis(SystemTime::now()).to_string()
}

fn machine_name() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// A running trace: writer, tracker and the thread pumping events
struct TraceSession<S: EventSource + 'static> {
    output: PathBuf,
    writer: Arc<Writer>,
    processes: Arc<Processes<S>>,
    watcher: Option<JoinHandle<forktrail::error::Result<()>>>,
}

impl<S: EventSource + 'static> TraceSession<S> {
    fn start(
        source: S,
        output: &Path,
        writer: Writer,
        config: TrackerConfig,
        session_name: String,
        filters: Vec<String>,
    ) -> Result<Self> {
        let writer = Arc::new(writer);
        let processes = Arc::new(Processes::with_config(source, writer.clone(), config));

        let worker = processes.clone();
        let watcher = thread::Builder::new()
            .name("forktrail-watch".to_string())
            .spawn(move || worker.watch(&session_name, filters.as_slice()))
            .context("Failed to spawn watcher thread")?;

        let session = Self {
            output: output.to_path_buf(),
            writer,
            processes,
            watcher: Some(watcher),
        };
        session.wait_until_tracing();
        Ok(session)
    }

    /// Give the kernel subscription a moment before launching anything
    fn wait_until_tracing(&self) {
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        while !self.processes.is_tracing() && !self.watcher_finished() {
            if Instant::now() >= deadline {
                tracing::warn!("event session not confirmed after {:?}", STARTUP_TIMEOUT);
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn watcher_finished(&self) -> bool {
        self.watcher.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop the tracker, then close the writer; idempotent
    fn shutdown(&mut self) -> Result<()> {
        let Some(watcher) = self.watcher.take() else {
            return Ok(());
        };

        self.writer.add_meta("forktrail.endTime", now_rfc3339());

        tracing::info!("shutting down watcher");
        self.processes.stop_watching();
        let watched = watcher.join();

        tracing::info!("shutting down writer");
        self.writer.close();

        eprintln!("[forktrail: Logged processes to {}]", self.output.display());
        eprintln!("[forktrail: Open this file in chrome://tracing or https://ui.perfetto.dev]");

        match watched {
            Ok(result) => result.context("Process watcher failed"),
            Err(_) => anyhow::bail!("Process watcher panicked"),
        }
    }
}

impl<S: EventSource + 'static> Drop for TraceSession<S> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            eprintln!("[forktrail: {:#}]", e);
        }
    }
}

fn spawn_command(command: &[String]) -> Result<Child> {
    let (program, args) = command
        .split_first()
        .context("Command array is empty")?;
    Command::new(program)
        .args(args)
        .spawn()
        .with_context(|| format!("Failed to run {}", program))
}

/// Kill the child and reap it
fn stop_child(child: &mut Child) -> Result<()> {
    if child.try_wait().context("Failed to wait for command")?.is_none() {
        tracing::info!(pid = child.id(), "killing command");
        // Already exited between the check and the kill is fine
        let _ = child.kill();
    }
    child.wait().context("Failed to wait for command")?;
    Ok(())
}

fn status_code(status: ExitStatus) -> u8 {
    status.code().map_or(1, |code| code as u8)
}

/// Wait for the child to exit, Ctrl-C, or the watcher to die
///
/// The child is always reaped before returning.
fn wait_for_command(
    child: &mut Child,
    watcher_finished: impl Fn() -> bool,
    interrupts: &Receiver<()>,
) -> Result<u8> {
    loop {
        if let Some(status) = child.try_wait().context("Failed to wait for command")? {
            return Ok(status_code(status));
        }
        if watcher_finished() {
            tracing::warn!("watcher ended before the command finished");
            stop_child(child)?;
            return Ok(1);
        }
        match interrupts.recv_timeout(WAIT_TICK) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                tracing::info!("interrupted; giving the command time to exit");
                let deadline = Instant::now() + INTERRUPT_GRACE;
                while Instant::now() < deadline {
                    if child.try_wait().context("Failed to wait for command")?.is_some() {
                        return Ok(130);
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                stop_child(child)?;
                return Ok(130);
            }
            Err(RecvTimeoutError::Timeout) => continue,
        }
    }
}

fn wait_for_interrupt(watcher_finished: impl Fn() -> bool, interrupts: &Receiver<()>) {
    eprintln!("[forktrail: No command specified, waiting for Ctrl-C]");
    while !watcher_finished() {
        match interrupts.recv_timeout(WAIT_TICK) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => continue,
        }
    }
}

/// Run the command (or wait for Ctrl-C) under an already started session
fn run_traced<S: EventSource + 'static>(
    session: &mut TraceSession<S>,
    command: &[String],
    interrupts: &Receiver<()>,
) -> Result<u8> {
    if session.watcher_finished() {
        // Tracing never started; report why instead of running untraced
        session.shutdown()?;
        anyhow::bail!("Process watcher stopped before tracing began");
    }

    let exit_code = if command.is_empty() {
        wait_for_interrupt(|| session.watcher_finished(), interrupts);
        0
    } else {
        eprintln!("[forktrail: Executing '{}']", command.join(" "));
        let mut child = spawn_command(command)?;
        wait_for_command(&mut child, || session.watcher_finished(), interrupts)?
    };

    session.shutdown()?;
    Ok(exit_code)
}

fn main() -> Result<ExitCode> {
    let args = Cli::parse();
    init_tracing(args.debug);

    let file_config = match &args.config {
        Some(path) => FileConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => FileConfig::default(),
    };
    let writer_config = file_config.writer_config()?;

    if !ProcConnector::new().is_elevated() {
        anyhow::bail!("forktrail needs root to subscribe to kernel process events");
    }

    let session_name = args
        .session
        .clone()
        .or_else(|| file_config.session_name.clone())
        .unwrap_or_else(|| DEFAULT_SESSION.to_string());
    let filters = if args.watch.is_empty() {
        file_config.watch.clone()
    } else {
        args.watch.clone()
    };
    let output = args
        .outfile
        .clone()
        .or_else(|| file_config.output.clone())
        .unwrap_or_else(default_output);
    let style = if args.complete || file_config.complete_spans == Some(true) {
        RecordStyle::Complete
    } else {
        RecordStyle::BeginEnd
    };
    let own_pid = std::process::id() as i32;
    let tracker_config = TrackerConfig {
        style,
        root_pid: args.tree.then_some(own_pid),
    };
    let command = args.command.unwrap_or_default();

    if filters.is_empty() && !args.tree {
        eprintln!("[forktrail: Watching all processes]");
    } else if filters.is_empty() {
        eprintln!("[forktrail: Watching descendants of process {}]", own_pid);
    } else {
        eprintln!("[forktrail: Watching for processes '{}']", filters.join(" "));
    }
    eprintln!("[forktrail: Logging to {}]", output.display());

    let writer = Writer::create_with_config(&output, writer_config)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    writer.add_meta("forktrail.fileName", output.display().to_string());
    writer.add_meta("forktrail.machine", machine_name());
    writer.add_meta("forktrail.command", command.join(" "));
    writer.add_meta("forktrail.startTime", now_rfc3339());
    writer.add_meta("forktrail.processID", own_pid.to_string());

    let (interrupt_tx, interrupt_rx) = channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.try_send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    let mut session = TraceSession::start(
        ProcConnector::new(),
        &output,
        writer,
        tracker_config,
        session_name,
        filters,
    )?;
    let exit_code = run_traced(&mut session, &command, &interrupt_rx)?;
    Ok(ExitCode::from(exit_code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use forktrail::config::WriterConfig;
    use forktrail::source::ChannelSource;

    fn sleeper() -> Child {
        Command::new("sleep").arg("30").spawn().unwrap()
    }

    #[test]
    fn test_wait_for_command_kills_child_when_watcher_dies() {
        let mut child = sleeper();
        let (_tx, rx) = channel::bounded::<()>(1);

        let start = Instant::now();
        let code = wait_for_command(&mut child, || true, &rx).unwrap();
        assert_eq!(code, 1);
        assert!(start.elapsed() < Duration::from_secs(10));
        // Reaped: the exit status is already known
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn test_wait_for_command_returns_exit_code() {
        let mut child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let (_tx, rx) = channel::bounded::<()>(1);
        assert_eq!(wait_for_command(&mut child, || false, &rx).unwrap(), 3);
    }

    #[test]
    fn test_stop_child_after_exit() {
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().unwrap();
        stop_child(&mut child).unwrap();
    }

    #[test]
    fn test_failed_startup_does_not_run_command() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let output = dir.path().join("trace.json");

        let (_events, rx) = channel::unbounded();
        let writer = Writer::create_with_config(&output, WriterConfig::default()).unwrap();
        let mut session = TraceSession::start(
            ChannelSource::new(rx).with_elevated(false),
            &output,
            writer,
            TrackerConfig::default(),
            "test".to_string(),
            Vec::new(),
        )
        .unwrap();

        let command = vec![
            "touch".to_string(),
            marker.display().to_string(),
        ];
        let (_tx, interrupts) = channel::bounded::<()>(1);
        let err = run_traced(&mut session, &command, &interrupts).unwrap_err();

        assert!(format!("{:#}", err).contains("Process watcher failed"));
        assert!(!marker.exists());
        // The document is still closed properly
        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
        assert!(doc["traceEvents"].as_array().unwrap().is_empty());
    }
}
