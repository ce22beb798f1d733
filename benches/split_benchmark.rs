use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use crawler_sync::reconcile::split_into_inserts_and_updates;
use crawler_sync::test_support::generate_crawl;
use crawler_sync::{
    Crawler, RemoteIdentifiableAdapter, RemoteStore, SecurityMode, SyncOptions,
};

/// Split a generated crawl against its remote.
fn benchmark_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("split_into_inserts_and_updates");
    group.sample_size(10);
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(10));

    // (experiments, existing_probability)
    let test_configs = vec![(200, 0.1), (200, 0.8), (2_000, 0.1), (2_000, 0.8)];

    for (experiments, existing) in test_configs {
        group.throughput(Throughput::Elements(experiments as u64));
        group.bench_with_input(
            BenchmarkId::new(
                "remote_adapter",
                format!("{}_experiments_{}%_existing", experiments, (existing * 100.0) as u32),
            ),
            &(experiments, existing),
            |b, (experiments, existing)| {
                b.iter_batched(
                    || {
                        let crawl = generate_crawl(*experiments, *existing, 42);
                        let remote: Arc<dyn RemoteStore> = Arc::new(crawl.remote);
                        let adapter =
                            RemoteIdentifiableAdapter::new(crawl.registry, remote.clone());
                        (crawl.graph, crawl.roots, adapter, remote)
                    },
                    |(mut graph, roots, adapter, remote)| {
                        black_box(
                            split_into_inserts_and_updates(
                                &mut graph,
                                &roots,
                                &adapter,
                                remote.as_ref(),
                            )
                            .unwrap(),
                        )
                    },
                    BatchSize::SmallInput,
                )
            },
        );
    }

    group.finish();
}

/// Full synchronization, including writes, in update mode.
fn benchmark_synchronize(c: &mut Criterion) {
    let mut group = c.benchmark_group("synchronize");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(10));

    for experiments in [200, 1_000] {
        group.throughput(Throughput::Elements(experiments as u64));
        group.bench_with_input(
            BenchmarkId::new("update_mode", experiments),
            &experiments,
            |b, experiments| {
                b.iter_batched(
                    || {
                        let crawl = generate_crawl(*experiments, 0.5, 7);
                        let remote: Arc<dyn RemoteStore> = Arc::new(crawl.remote);
                        let adapter =
                            RemoteIdentifiableAdapter::new(crawl.registry, remote.clone());
                        let crawler = Crawler::new(
                            adapter,
                            remote,
                            SyncOptions {
                                security_mode: SecurityMode::Update,
                                ..SyncOptions::default()
                            },
                        );
                        (crawl.graph, crawl.roots, crawler)
                    },
                    |(mut graph, roots, crawler)| {
                        black_box(crawler.synchronize(&mut graph, &roots).unwrap())
                    },
                    BatchSize::SmallInput,
                )
            },
        );
    }

    group.finish();
}

criterion_group!(benches, benchmark_split);
criterion_group! {
    name = sync_benches;
    config = Criterion::default().without_plots();
    targets = benchmark_synchronize
}
criterion_main!(benches, sync_benches);
