//! Streaming writer tests against real files and slow sinks

use forktrail::config::WriterConfig;
use forktrail::record::{Args, TraceRecord, NONE};
use forktrail::writer::Writer;
use serde_json::Value;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn config(flush_ms: u64) -> WriterConfig {
    WriterConfig {
        flush_interval: Duration::from_millis(flush_ms),
        shutdown_timeout: Duration::from_secs(5),
    }
}

fn read_doc(path: &std::path::Path) -> Value {
    let text = std::fs::read_to_string(path).unwrap();
    serde_json::from_str(&text).unwrap()
}

#[test]
fn test_file_document_shape() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("trace.json");
    let writer = Writer::create_with_config(&path, config(10)).unwrap();

    let mut args = Args::new();
    args.push("ProcessID", "7");
    writer.add_entry(TraceRecord::instant("s started", 0.0));
    writer.add_entry(TraceRecord::begin(NONE, 0, 10.0, "make", args.clone()));
    writer.add_entry(TraceRecord::end(NONE, 0, 20.0, args));
    writer.add_meta("forktrail.machine", "build-01");
    writer.close();

    let doc = read_doc(&path);
    let events = doc["traceEvents"].as_array().unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[1]["name"], "make");
    assert_eq!(events[2]["ph"], "E");
    assert_eq!(doc["forktrail.machine"], "build-01");
}

#[test]
fn test_meta_keys_keep_insertion_order() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("trace.json");
    let writer = Writer::create_with_config(&path, config(10)).unwrap();
    writer.add_meta("b", "1");
    writer.add_meta("a", "2");
    writer.add_meta("b", "3");
    writer.close();

    let text = std::fs::read_to_string(&path).unwrap();
    let b = text.find("\"b\": \"1,3\"").unwrap();
    let a = text.find("\"a\": \"2\"").unwrap();
    assert!(b < a);
}

#[test]
fn test_partial_file_is_readable_while_tracing() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("trace.json");
    let writer = Writer::create_with_config(&path, config(5)).unwrap();
    writer.add_entry(TraceRecord::instant("checkpoint", 1.0));

    let deadline = Instant::now() + Duration::from_secs(5);
    while writer.written() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("{\n\"traceEvents\": [\n"));
    assert!(text.contains("\"checkpoint\""));
    writer.close();
}

#[test]
fn test_close_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("trace.json");
    let writer = Writer::create_with_config(&path, config(10)).unwrap();
    writer.add_entry(TraceRecord::instant("x", 0.0));
    writer.close();
    let first = std::fs::read_to_string(&path).unwrap();

    writer.close();
    drop(writer);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), first);
}

#[test]
fn test_drop_finishes_document() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("trace.json");
    {
        let writer = Writer::create_with_config(&path, config(10)).unwrap();
        writer.add_entry(TraceRecord::instant("x", 0.0));
    }
    let doc = read_doc(&path);
    assert_eq!(doc["traceEvents"].as_array().unwrap().len(), 1);
}

/// Sink that takes a while on every write
struct SlowSink {
    delay: Duration,
    writes: Arc<AtomicUsize>,
}

impl Write for SlowSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        thread::sleep(self.delay);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_add_entry_does_not_wait_for_slow_sink() {
    let writes = Arc::new(AtomicUsize::new(0));
    let sink = SlowSink {
        delay: Duration::from_millis(5),
        writes: writes.clone(),
    };
    let writer = Writer::from_sink(
        sink,
        WriterConfig {
            flush_interval: Duration::from_millis(1),
            shutdown_timeout: Duration::from_secs(30),
        },
    );

    // Two 5ms writes per record: a waiting add_entry would need a second
    let start = Instant::now();
    for i in 0..100 {
        writer.add_entry(TraceRecord::begin(NONE, 0, i as f64, "p", Args::new()));
    }
    assert!(start.elapsed() < Duration::from_millis(200));
    assert!(writer.pending() > 0);

    writer.close();
    assert_eq!(writer.written(), 100);
    assert!(writes.load(Ordering::Relaxed) > 0);
}

#[test]
fn test_concurrent_producers() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("trace.json");
    let writer = Arc::new(Writer::create_with_config(&path, config(2)).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let writer = writer.clone();
            thread::spawn(move || {
                for i in 0..250 {
                    writer.add_entry(TraceRecord::begin(NONE, t, i as f64, "p", Args::new()));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    writer.close();

    let doc = read_doc(&path);
    assert_eq!(doc["traceEvents"].as_array().unwrap().len(), 1000);
}
