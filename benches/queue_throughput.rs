use anachron::event::Event;
use anachron::queue::{EventQueue, LadderQueue, ThreeTierQueue, TwoTierLadderQueue};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

fn workload(n: usize, agents: u64) -> Vec<Arc<Event>> {
    let mut rng = StdRng::seed_from_u64(0xBEEF);
    (0..n)
        .map(|i| {
            let receiver = rng.gen_range(0..agents);
            let recv = rng.gen_range(0.0..1000.0f64);
            let e = Event::new(i as u64 + agents, receiver, 0.0, recv, vec![]).unwrap();
            e.retain_input();
            e
        })
        .collect()
}

fn drain(queue: &mut dyn EventQueue) {
    let mut batch = Vec::new();
    while !queue.is_empty() {
        batch.clear();
        queue.dequeue_next_agent_batch(&mut batch);
        for e in &batch {
            e.release_input().unwrap();
        }
        black_box(batch.len());
    }
}

fn bench_enqueue_dequeue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_throughput");

    for &n in [1_000usize, 10_000, 100_000].iter() {
        group.bench_with_input(BenchmarkId::new("three_tier", n), &n, |b, &n| {
            b.iter_with_setup(
                || workload(n, 64),
                |events| {
                    let mut q = ThreeTierQueue::new();
                    for e in events {
                        q.enqueue(e);
                    }
                    drain(&mut q);
                },
            )
        });
        group.bench_with_input(BenchmarkId::new("ladder", n), &n, |b, &n| {
            b.iter_with_setup(
                || workload(n, 64),
                |events| {
                    let mut q = LadderQueue::new(8);
                    for e in events {
                        q.enqueue(e);
                    }
                    drain(&mut q);
                },
            )
        });
        group.bench_with_input(BenchmarkId::new("two_tier_ladder", n), &n, |b, &n| {
            b.iter_with_setup(
                || workload(n, 64),
                |events| {
                    let mut q = TwoTierLadderQueue::new(8, 32);
                    for e in events {
                        q.enqueue(e);
                    }
                    drain(&mut q);
                },
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_enqueue_dequeue);
criterion_main!(benches);
