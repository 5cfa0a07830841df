//! Hot-path benchmarks for the event pump
//!
//! The tracker runs inside the kernel event delivery loop, so the two calls
//! it makes per event must stay cheap:
//!
//! 1. `LaneAllocator::add_child` / `remove_child` - a short locked scan
//! 2. `Writer::add_entry` - a lock-free enqueue; file I/O happens elsewhere
//!
//! # Run Instructions
//!
//! ```bash
//! cargo bench --bench writer_overhead
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use forktrail::config::WriterConfig;
use forktrail::lanes::LaneAllocator;
use forktrail::record::{Args, TraceRecord, NONE};
use forktrail::writer::Writer;
use std::time::Duration;

fn bench_args() -> Args {
    let mut args = Args::new();
    args.push("ProcessID", "4242");
    args.push("ParentID", "4241");
    args.push("CommandLine", "/usr/bin/cc -c -O2 -o main.o main.c");
    args
}

fn bench_add_entry(c: &mut Criterion) {
    let writer = Writer::from_sink(
        std::io::sink(),
        WriterConfig {
            flush_interval: Duration::from_millis(10),
            shutdown_timeout: Duration::from_secs(30),
        },
    );
    let args = bench_args();

    c.bench_function("writer_add_entry", |b| {
        let mut ts = 0.0;
        b.iter(|| {
            ts += 1.0;
            writer.add_entry(black_box(TraceRecord::begin(
                NONE,
                0,
                ts,
                "cc",
                args.clone(),
            )));
        });
    });

    writer.close();
}

fn bench_record_serialize(c: &mut Criterion) {
    let record = TraceRecord::begin(NONE, 3, 1_234_567.0, "cc", bench_args());
    c.bench_function("record_to_json", |b| {
        b.iter(|| black_box(&record).to_json());
    });
}

fn bench_lane_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("lane_churn");

    // Cost grows with the number of live lanes the scan walks
    for live in [1usize, 16, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(live), &live, |b, &live| {
            let lanes = LaneAllocator::new();
            for pid in 0..live as i32 {
                lanes.add_child(pid, NONE);
            }
            let mut next = live as i32;
            b.iter(|| {
                let lane = lanes.add_child(next, NONE);
                black_box(lane);
                lanes.remove_child(next);
                next += 1;
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_add_entry,
    bench_record_serialize,
    bench_lane_churn
);
criterion_main!(benches);
