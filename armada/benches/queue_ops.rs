//! Benchmarks for task queue operations using criterion.
//!
//! These benchmarks measure:
//! - Single task enqueue
//! - Batch enqueue
//! - Full lifecycle (enqueue → read → handle → ack)
//! - Backoff delay computation

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use armada::{
    BackoffPolicy, Broker, EventPublisher, InMemoryBroker, InMemoryStatusStore, InProcEventBus,
    NewTask, QueueConfig, ReadRequest, StatusStore, TaskQueue,
};
use armada_testkit::ScriptedHandler;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tokio::runtime::Runtime;

/// Creates a tokio runtime for async benchmarks.
fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn create_queue(broker: Arc<InMemoryBroker>) -> TaskQueue {
    let store: Arc<dyn StatusStore> = Arc::new(InMemoryStatusStore::new());
    let events: Arc<dyn EventPublisher> = Arc::new(InProcEventBus::new("bench", 1024));
    TaskQueue::new(QueueConfig::default(), broker, store, events)
}

fn bench_enqueue_single(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("enqueue_single");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("in_memory", |b| {
        let queue = create_queue(Arc::new(InMemoryBroker::new()));
        let task = NewTask::new("bench", json!({ "host": "web-1" }));

        b.to_async(&rt).iter(|| async {
            let _ = queue
                .enqueue("bench", task.clone())
                .await
                .expect("enqueue should succeed");
        });
    });

    group.finish();
}

fn bench_enqueue_batch(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("enqueue_batch");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(15));

    for batch_size in [10usize, 50, 100] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("in_memory", batch_size),
            &batch_size,
            |b, &size| {
                let queue = create_queue(Arc::new(InMemoryBroker::new()));

                b.to_async(&rt).iter(|| async {
                    for i in 0..size {
                        queue
                            .enqueue("bench", NewTask::new("bench", json!({ "n": i })))
                            .await
                            .expect("enqueue should succeed");
                    }
                });
            },
        );
    }

    group.finish();
}

/// Enqueue, read through the consumer group, run the handler and ack.
fn bench_full_lifecycle(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("full_lifecycle");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("in_memory", |b| {
        let broker = Arc::new(InMemoryBroker::new());
        let queue = create_queue(Arc::clone(&broker));
        let handler = ScriptedHandler::new();
        rt.block_on(broker.ensure_group("bench", "workers"))
            .expect("group should be created");
        let request = ReadRequest {
            topic: "bench".to_string(),
            group: "workers".to_string(),
            consumer: "c1".to_string(),
            count: 1,
            block: Duration::ZERO,
            claim_idle: Duration::from_secs(60),
        };

        b.to_async(&rt).iter(|| async {
            queue
                .enqueue("bench", NewTask::new("bench", json!({})))
                .await
                .expect("enqueue should succeed");
            let deliveries = broker
                .read_group(request.clone())
                .await
                .expect("read should succeed");
            for delivery in deliveries {
                queue
                    .process_delivery("bench", "workers", &handler, delivery)
                    .await
                    .expect("processing should succeed");
            }
        });
    });

    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(300));
    c.bench_function("backoff_delay_for", |b| {
        b.iter(|| {
            for n in 0..32u32 {
                black_box(policy.delay_for(black_box(n)));
            }
        });
    });
}

criterion_group!(
    benches,
    bench_enqueue_single,
    bench_enqueue_batch,
    bench_full_lifecycle,
    bench_backoff
);
criterion_main!(benches);
