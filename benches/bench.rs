//! Criterion benchmarks for shard search and assembly.
//!
//! - Flat shard search
//! - Sharded search with global top-k merging, by shard count
//! - Shard encoding and decoding

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use glaive::vector::index::AnnIndex;
use glaive::vector::index::flat::FlatIndex;
use glaive::vector::index::io::{decode_shard, encode_shard};
use glaive::vector::index::sharded::ShardedIndex;
use glaive::vector::{DistanceMetric, Vector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DIMENSION: usize = 64;
const CANDIDATES: usize = 20_000;

fn generate_vectors(rng: &mut StdRng, count: usize, dim: usize) -> Vec<Vector> {
    (0..count)
        .map(|_| Vector::new((0..dim).map(|_| rng.random_range(-1.0..1.0)).collect()))
        .collect()
}

fn build_shards(vectors: &[Vector], shard_count: usize) -> ShardedIndex {
    let mut index = ShardedIndex::new(DIMENSION, DistanceMetric::L2);
    let per_shard = vectors.len().div_ceil(shard_count);
    for (shard, chunk) in vectors.chunks(per_shard).enumerate() {
        let ids: Vec<u64> = (0..chunk.len())
            .map(|i| (shard * per_shard + i) as u64)
            .collect();
        let mut flat = FlatIndex::new(DIMENSION, DistanceMetric::L2);
        flat.add_with_ids(chunk, &ids).unwrap();
        index.add_shard(flat).unwrap();
    }
    index
}

fn bench_flat_search(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    let vectors = generate_vectors(&mut rng, CANDIDATES, DIMENSION);
    let queries = generate_vectors(&mut rng, 32, DIMENSION);
    let ids: Vec<u64> = (0..CANDIDATES as u64).collect();

    let mut index = FlatIndex::new(DIMENSION, DistanceMetric::L2);
    index.add_with_ids(&vectors, &ids).unwrap();

    let mut group = c.benchmark_group("flat_search");
    group.throughput(Throughput::Elements(queries.len() as u64));
    group.bench_function("top_10", |b| {
        b.iter(|| black_box(index.search(black_box(&queries), 10).unwrap()))
    });
    group.finish();
}

fn bench_sharded_search(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(11);
    let vectors = generate_vectors(&mut rng, CANDIDATES, DIMENSION);
    let queries = generate_vectors(&mut rng, 32, DIMENSION);

    let mut group = c.benchmark_group("sharded_search");
    group.sample_size(20);
    group.throughput(Throughput::Elements(queries.len() as u64));
    for shard_count in [1, 4, 16] {
        let index = build_shards(&vectors, shard_count);
        group.bench_with_input(
            BenchmarkId::from_parameter(shard_count),
            &shard_count,
            |b, _| b.iter(|| black_box(index.search(black_box(&queries), 10).unwrap())),
        );
    }
    group.finish();
}

fn bench_shard_codec(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(3);
    let vectors = generate_vectors(&mut rng, 5_000, DIMENSION);
    let ids: Vec<u64> = (0..vectors.len() as u64).collect();
    let mut index = FlatIndex::new(DIMENSION, DistanceMetric::L2);
    index.add_with_ids(&vectors, &ids).unwrap();
    let bytes = encode_shard(&index).unwrap();

    let mut group = c.benchmark_group("shard_codec");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("encode", |b| {
        b.iter(|| black_box(encode_shard(black_box(&index)).unwrap()))
    });
    group.bench_function("decode", |b| {
        b.iter(|| black_box(decode_shard(black_box(&bytes)).unwrap()))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_flat_search,
    bench_sharded_search,
    bench_shard_codec
);
criterion_main!(benches);
