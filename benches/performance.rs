//! Performance benchmarks for the catalog.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use catalog::{
    HealthCheck, HealthStatus, RegisterRequest, ServiceInstance, Store, SubscribeRequest, Topic, WatchSet,
};
use std::io::Cursor;

fn registration(node: usize, service: &str, status: HealthStatus) -> RegisterRequest {
    let name = format!("node-{}", node);
    RegisterRequest::new(&name, format!("10.0.{}.{}", node / 250, node % 250))
        .with_service(ServiceInstance::new(service, 8080).with_tags(&["v1"]))
        .with_check(HealthCheck::node_check(&name, "serfHealth", HealthStatus::Passing))
        .with_check(HealthCheck::service_check(&name, format!("{}-alive", service), service, status))
}

/// A store with `nodes` nodes, each running one instance of one of
/// `services` service names.
fn populated(nodes: usize, services: usize) -> Store {
    let store = Store::default();
    for n in 0..nodes {
        let service = format!("svc-{}", n % services);
        store
            .ensure_registration(n as u64 + 1, registration(n, &service, HealthStatus::Passing))
            .unwrap();
    }
    store
}

/// Benchmark full registrations into an empty catalog
fn bench_registration(c: &mut Criterion) {
    let mut group = c.benchmark_group("registration");

    for count in [100, 1000] {
        group.bench_with_input(BenchmarkId::new("nodes", count), &count, |b, &count| {
            b.iter(|| {
                let store = Store::default();
                for n in 0..count {
                    store
                        .ensure_registration(n as u64 + 1, registration(n, "web", HealthStatus::Passing))
                        .unwrap();
                }
                black_box(store.stats());
            });
        });
    }

    group.finish();
}

/// Benchmark anti-entropy style re-registration that changes nothing
fn bench_noop_registration(c: &mut Criterion) {
    let store = populated(1000, 10);
    let req = registration(500, "svc-0", HealthStatus::Passing);

    c.bench_function("noop_registration", |b| {
        let mut idx = 10_000;
        b.iter(|| {
            idx += 1;
            store.ensure_registration(idx, black_box(req.clone())).unwrap();
        });
    });
}

/// Benchmark check flaps with live subscribers attached, across catalog
/// sizes. Per-write cost should stay roughly flat as the catalog grows.
fn bench_check_flap(c: &mut Criterion) {
    let mut group = c.benchmark_group("check_flap");

    for nodes in [100, 1000, 5000] {
        let store = populated(nodes, 10);
        let _subs: Vec<_> = (0..10)
            .map(|s| {
                store
                    .subscribe(SubscribeRequest::new(Topic::ServiceHealth, format!("svc-{}", s)).with_buffer_size(1 << 20))
                    .unwrap()
            })
            .collect();

        group.bench_with_input(BenchmarkId::new("service_check", nodes), &store, |b, store| {
            let mut idx = 10_000u64;
            b.iter(|| {
                idx += 1;
                let status = if idx % 2 == 0 { HealthStatus::Critical } else { HealthStatus::Passing };
                store
                    .ensure_check(idx, HealthCheck::service_check("node-7", "svc-7-alive", "svc-7", status))
                    .unwrap();
            });
        });

        group.bench_with_input(BenchmarkId::new("node_check", nodes), &store, |b, store| {
            let mut idx = 1_000_000u64;
            b.iter(|| {
                idx += 1;
                let status = if idx % 2 == 0 { HealthStatus::Critical } else { HealthStatus::Passing };
                store
                    .ensure_check(idx, HealthCheck::node_check("node-7", "serfHealth", status))
                    .unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark joined health reads with and without watch arming
fn bench_check_service_nodes(c: &mut Criterion) {
    let mut group = c.benchmark_group("check_service_nodes");

    for instances in [10, 100, 1000] {
        let store = populated(instances, 1);

        group.bench_with_input(BenchmarkId::new("plain", instances), &store, |b, store| {
            b.iter(|| black_box(store.check_service_nodes(None, "svc-0").unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("watched", instances), &store, |b, store| {
            b.iter(|| {
                let mut ws = WatchSet::new();
                black_box(store.check_service_nodes(Some(&mut ws), "svc-0").unwrap());
                black_box(ws.len())
            });
        });
    }

    group.finish();
}

/// Benchmark snapshot persist and restore
fn bench_snapshot(c: &mut Criterion) {
    let store = populated(1000, 10);

    c.bench_function("snapshot_persist", |b| {
        b.iter(|| {
            let mut buf = Vec::new();
            store.snapshot().persist(&mut buf).unwrap();
            black_box(buf.len())
        });
    });

    let mut buf = Vec::new();
    store.snapshot().persist(&mut buf).unwrap();
    c.bench_function("snapshot_restore", |b| {
        b.iter(|| {
            let target = Store::default();
            black_box(target.restore_from(&mut Cursor::new(&buf)).unwrap())
        });
    });
}

criterion_group!(
    benches,
    bench_registration,
    bench_noop_registration,
    bench_check_flap,
    bench_check_service_nodes,
    bench_snapshot,
);

criterion_main!(benches);
