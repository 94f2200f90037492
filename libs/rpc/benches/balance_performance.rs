//! Hot-path costs of instance selection and call correlation
//!
//! Selection runs once per call attempt and registry churn once per call, so
//! both must stay cheap as the instance count and in-flight calls grow.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rpc::balance::{fair_weight, FairBalancer, RandomBalancer, RoundRobinBalancer};
use rpc::{
    CorrelationRegistry, FairConfig, HealthTracker, Instance, LoadBalancer, PendingCall, Response,
    WeightTree,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn trackers(count: u16) -> Vec<Arc<HealthTracker>> {
    (0..count)
        .map(|i| {
            let health = Arc::new(HealthTracker::new(Instance::new("10.1.0.1", 9000 + i), 4));
            for _ in 0..4 {
                health.update_latency(5 + u64::from(i % 50));
            }
            health
        })
        .collect()
}

fn bench_weight_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("weight_tree");

    for count in [4u16, 64, 512] {
        let candidates = trackers(count);
        let leaves: Vec<_> = candidates
            .iter()
            .map(|h| {
                let avg = h.average_latency_ms().unwrap_or(0);
                (Arc::clone(h), fair_weight(avg, 3_000))
            })
            .collect();

        group.bench_with_input(BenchmarkId::new("build", count), &leaves, |b, leaves| {
            b.iter(|| black_box(WeightTree::build(leaves.clone())));
        });

        let tree = WeightTree::build(leaves).expect("non-empty leaves");
        let mut rng = StdRng::seed_from_u64(7);
        group.bench_with_input(BenchmarkId::new("select", count), &tree, |b, tree| {
            b.iter(|| black_box(tree.select_with(&mut rng).map(|h| h.instance().port)));
        });
    }

    group.finish();
}

fn bench_balancers(c: &mut Criterion) {
    let mut group = c.benchmark_group("balancer_select");
    let candidates = trackers(64);
    let tried = HashSet::new();

    let random = RandomBalancer::new();
    group.bench_function("random", |b| {
        b.iter(|| black_box(random.select(&candidates, &tried)));
    });

    let round_robin = RoundRobinBalancer::new();
    group.bench_function("round_robin", |b| {
        b.iter(|| black_box(round_robin.select(&candidates, &tried)));
    });

    let fair = FairBalancer::new(FairConfig::default(), 3_000);
    fair.refresh(&candidates);
    group.bench_function("latency_fair", |b| {
        b.iter(|| black_box(fair.select(&candidates, &tried)));
    });

    group.finish();
}

fn bench_registry_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("registry");
    let registry = CorrelationRegistry::default();
    let health = Arc::new(HealthTracker::new(Instance::new("10.1.0.1", 9000), 16));

    group.bench_function("register_resolve", |b| {
        b.iter(|| {
            let (call, _waiter) =
                PendingCall::with_waiter("bench.ping", Duration::from_secs(1), Arc::clone(&health));
            let id = registry.register(call).expect("registry has room");
            black_box(registry.resolve(id, Ok(Response::ok(id, Bytes::new()))))
        });
    });

    group.finish();
}

criterion_group!(benches, bench_weight_tree, bench_balancers, bench_registry_churn);
criterion_main!(benches);
