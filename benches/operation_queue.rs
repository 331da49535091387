//! Benchmark for per-resource operation queues and node slot accounting
//!
//! Target: 100K enqueue/lock/unlock cycles per second

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use replicated_disk_operator::state::{OperationKind, OperationQueues, SharedState};
use std::sync::Arc;

fn bench_lock_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("operation_queue");
    group.throughput(Throughput::Elements(1));

    group.bench_function("enqueue_lock_unlock", |b| {
        let queues = OperationQueues::new();
        let mut counter = 0u64;

        b.iter(|| {
            counter += 1;
            let name = format!("vol-{}", counter % 1000);
            queues.enqueue(black_box(&name), OperationKind::Attach);
            if queues.try_lock(&name).is_some() {
                while queues.unlock(&name).is_some() {}
            }
        });
    });

    group.bench_function("enqueue_duplicate", |b| {
        let queues = OperationQueues::new();
        queues.enqueue("vol-0", OperationKind::Create);

        b.iter(|| {
            let _ = queues.enqueue(black_box("vol-0"), OperationKind::Create);
        });
    });

    group.finish();
}

fn bench_concurrent_resources(c: &mut Criterion) {
    let mut group = c.benchmark_group("operation_queue");
    group.throughput(Throughput::Elements(100));

    let queues = Arc::new(OperationQueues::new());
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");

    group.bench_function("concurrent_100_resources", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut handles = Vec::new();
                for i in 0..100 {
                    let queues = queues.clone();
                    handles.push(tokio::spawn(async move {
                        let name = format!("vol-{:03}", i);
                        queues.enqueue(&name, OperationKind::Create);
                        if queues.try_lock(&name).is_some() {
                            while queues.unlock(&name).is_some() {}
                        }
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
            });
        });
    });

    group.finish();
}

fn bench_slot_reservation(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_slots");
    group.throughput(Throughput::Elements(1));

    let state = SharedState::new();
    for i in 0..100 {
        state.set_node_capacity(&format!("node-{:03}", i), 64);
    }

    group.bench_function("reserve_release", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let node = format!("node-{:03}", counter % 100);
            if state.reserve_slot(black_box(&node)) {
                state.release_slot(&node);
            }
        });
    });

    group.bench_function("snapshot_availability", |b| {
        b.iter(|| black_box(state.snapshot_availability()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_lock_cycle,
    bench_concurrent_resources,
    bench_slot_reservation,
);
criterion_main!(benches);
