//! Adapted from the teacher's spsc benches: same shapes (create, throughput,
//! latency, small buffer), re-pointed at this crate's own primitives — a
//! rendezvous `pipe::channel` stands in for the old lock-free SPSC ring, and
//! a buffered `primitives::queue` stands in for its bounded variant.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use skein::primitives::queue;
use skein::{pipe, Hub};

fn create_hub_and_rendezvous_pipe(c: &mut Criterion) {
    c.bench_function("create/hub+pipe", |b| {
        b.iter(|| {
            let hub = Hub::new();
            let (tx, rx) = pipe::channel::<u64>(hub.clone());
            black_box((tx, rx));
        });
    });
}

fn rendezvous_throughput(c: &mut Criterion) {
    const N: u64 = 1_000;
    c.bench_function("throughput/pipe_rendezvous_1000", |b| {
        b.iter(|| {
            let hub = Hub::new();
            let (tx, rx) = pipe::channel::<u64>(hub.clone());
            hub.spawn(async move {
                for i in 0..N {
                    tx.send(i, None).await.unwrap();
                }
            });
            hub.spawn(async move {
                let mut sum = 0u64;
                for _ in 0..N {
                    sum += rx.recv(None).await.unwrap();
                }
                black_box(sum);
            });
            hub.run();
        });
    });
}

fn queue_throughput(c: &mut Criterion) {
    const N: u64 = 1_000;
    c.bench_function("throughput/queue_capacity_64", |b| {
        b.iter(|| {
            let hub = Hub::new();
            let (tx, rx) = queue::queue::<u64>(hub.clone(), 64);
            hub.spawn(async move {
                for i in 0..N {
                    tx.send(i, None).await.unwrap();
                }
            });
            hub.spawn(async move {
                let mut sum = 0u64;
                for _ in 0..N {
                    sum += rx.recv(None).await.unwrap();
                }
                black_box(sum);
            });
            hub.run();
        });
    });
}

fn small_buffer_backpressure(c: &mut Criterion) {
    const N: u64 = 200;
    c.bench_function("small_buffer/queue_capacity_1", |b| {
        b.iter(|| {
            let hub = Hub::new();
            let (tx, rx) = queue::queue::<u64>(hub.clone(), 1);
            hub.spawn(async move {
                for i in 0..N {
                    tx.send(i, None).await.unwrap();
                }
            });
            hub.spawn(async move {
                for _ in 0..N {
                    black_box(rx.recv(None).await.unwrap());
                }
            });
            hub.run();
        });
    });
}

fn single_round_trip_latency(c: &mut Criterion) {
    c.bench_function("latency/single_rendezvous", |b| {
        b.iter(|| {
            let hub = Hub::new();
            let (tx, rx) = pipe::channel::<u64>(hub.clone());
            hub.spawn(async move {
                tx.send(42, None).await.unwrap();
            });
            hub.spawn(async move {
                black_box(rx.recv(None).await.unwrap());
            });
            hub.run();
        });
    });
}

criterion_group!(
    benches,
    create_hub_and_rendezvous_pipe,
    rendezvous_throughput,
    queue_throughput,
    small_buffer_backpressure,
    single_round_trip_latency,
);
criterion_main!(benches);
