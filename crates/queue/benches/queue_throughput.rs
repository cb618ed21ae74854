use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use pdfgen_core::{now_millis, LockToken};
use pdfgen_queue::{
    BrokerConfig, BrokerConnection, DefaultJobOptions, InMemoryBackend, JobOptions, Queue,
};
use serde_json::json;

fn setup() -> Queue {
    let broker = BrokerConnection::connect(InMemoryBackend::arc(), BrokerConfig::default())
        .expect("in-memory broker connects");
    let queue = Queue::new(broker, "bench", DefaultJobOptions::single_attempt());
    queue.init().expect("queue init");
    queue
}

fn payload(i: usize) -> serde_json::Value {
    json!({
        "templateId": "invoice",
        "objectId": format!("obj-{i}"),
        "objectType": "deal",
        "objectData": { "name": "Acme", "amount": i },
    })
}

fn bench_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue");

    for size in [100usize, 1_000, 5_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let queue = setup();
                for i in 0..size {
                    let enqueued = queue
                        .enqueue("generate-pdf", &payload(i), JobOptions::new())
                        .expect("enqueue");
                    black_box(enqueued);
                }
            });
        });
    }

    group.finish();
}

fn bench_enqueue_and_claim(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue_and_claim");

    for size in [100usize, 1_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let queue = setup();
                for i in 0..size {
                    let options = JobOptions::new().priority((i % 4) as u8);
                    queue.enqueue("generate-pdf", &payload(i), options).expect("enqueue");
                }
                let broker = queue.broker();
                let mut claimed = 0usize;
                while let Some(job) = broker
                    .call(|b| b.claim_next(queue.name(), LockToken::new(), now_millis(), 30_000))
                    .expect("claim")
                {
                    black_box(job);
                    claimed += 1;
                }
                assert_eq!(claimed, size);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_enqueue, bench_enqueue_and_claim);
criterion_main!(benches);
