use criterion::{criterion_group, criterion_main, Criterion};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use shard_rounds::algorithms::dbscan::{self, DbscanConfig};
use shard_rounds::algorithms::kmeans::{self, KMeansConfig};
use shard_rounds::algorithms::moments::compute_moments;
use shard_rounds::data::random_centers;
use shard_rounds::{generate_clustered_points, ShardFailurePolicy, ShardSet, TerminationConfig};

fn bench_rounds(c: &mut Criterion) {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let centers = random_centers(8, 8, 80.0, &mut rng);
    let points = generate_clustered_points(2_500, &centers, 1.0, &mut rng).expect("bench data");
    let config = KMeansConfig {
        k: 8,
        termination: TerminationConfig {
            max_iterations: 100,
            convergence_threshold: 1e-6,
            ..TerminationConfig::default()
        },
        ..KMeansConfig::default()
    };

    for n_shards in [1, 4, 16] {
        c.bench_function(&format!("kmeans_20k_8d_{n_shards}_shards"), |b| {
            b.iter(|| {
                let mut shards = ShardSet::split_rows(&points, n_shards).expect("split");
                let _run = kmeans::train_distributed(&mut shards, &config).expect("kmeans bench run");
            });
        });
    }

    c.bench_function("kmeans_20k_8d_4_shards_wire", |b| {
        b.iter(|| {
            let mut shards = ShardSet::split_rows(&points, 4)
                .expect("split")
                .with_wire_boundary(true);
            let _run = kmeans::train_distributed(&mut shards, &config).expect("wire bench run");
        });
    });

    c.bench_function("moments_20k_8d_4_shards", |b| {
        b.iter(|| {
            let mut shards = ShardSet::split_rows(&points, 4).expect("split");
            let _run = compute_moments(&mut shards, ShardFailurePolicy::Fatal).expect("moments bench run");
        });
    });

    let small = points.slice(ndarray::s![..4_000, ..]).to_owned();
    let dbscan_config = DbscanConfig {
        epsilon: 1.5,
        min_observations: 5,
        ..DbscanConfig::default()
    };
    c.bench_function("dbscan_4k_8d_4_shards", |b| {
        b.iter(|| {
            let mut shards = ShardSet::split_rows(&small, 4).expect("split");
            let _out = dbscan::cluster(&mut shards, &dbscan_config).expect("dbscan bench run");
        });
    });
}

criterion_group!(benches, bench_rounds);
criterion_main!(benches);
