//! Benchmarks for the deduper and event bus hot paths
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use livesync::{
    BusEvent, ChangeKind, ChannelState, DedupConfig, EventBus, EventDeduper, EventFingerprint,
    EventKind, Handler,
};
use std::sync::Arc;

const SCOPE: &str = "jobs|UPDATE|";

fn create_fingerprints(count: usize) -> Vec<EventFingerprint> {
    (0..count)
        .map(|i| EventFingerprint::new("jobs", ChangeKind::Update, i.to_string(), format!("T{}", i)))
        .collect()
}

fn bench_deduper(c: &mut Criterion) {
    let mut group = c.benchmark_group("deduper");

    for size in [100, 500, 5000] {
        let fingerprints = create_fingerprints(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_function(format!("unique_{}", size), |b| {
            b.iter(|| {
                let deduper = EventDeduper::new(DedupConfig::default());
                for fp in &fingerprints {
                    black_box(deduper.should_process(SCOPE, fp));
                }
            })
        });

        group.bench_function(format!("redelivery_{}", size), |b| {
            let deduper = EventDeduper::new(DedupConfig::default());
            for fp in &fingerprints {
                deduper.record(fp);
            }
            b.iter(|| {
                for fp in &fingerprints {
                    black_box(deduper.should_process(SCOPE, fp));
                }
            })
        });
    }

    group.finish();
}

fn bench_bus(c: &mut Criterion) {
    let mut group = c.benchmark_group("bus");

    for listeners in [1, 10, 100] {
        let bus = EventBus::default();
        for _ in 0..listeners {
            let handler: Handler = Arc::new(|event: &BusEvent| {
                black_box(event);
            });
            bus.on(EventKind::ConnectivityFatal, handler, None);
        }

        group.throughput(Throughput::Elements(listeners as u64));
        group.bench_function(format!("fan_out_{}", listeners), |b| {
            b.iter(|| {
                bus.emit(black_box(BusEvent::ConnectivityFatal {
                    channel: "realtime:jobs:update".to_string(),
                    attempts: 5,
                }))
            })
        });
    }

    let bus = EventBus::default();
    let handler: Handler = Arc::new(|event: &BusEvent| {
        black_box(event);
    });
    bus.on(EventKind::ChannelStatus, handler, None);
    group.bench_function("suppressed_repeat", |b| {
        b.iter(|| {
            bus.emit(black_box(BusEvent::ChannelStatus {
                channel: "realtime:jobs:update".to_string(),
                state: ChannelState::Open,
            }))
        })
    });

    group.finish();
}

criterion_group!(benches, bench_deduper, bench_bus);
criterion_main!(benches);
