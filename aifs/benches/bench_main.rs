use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use aifs::compress::Compressor;
use aifs::merkle::MerkleTree;

/// Performance benchmarks for the hashing, Merkle and compression paths.

fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn bench_content_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("content_hash");
    for size in [1usize << 10, 1 << 16, 1 << 20] {
        group.throughput(Throughput::Bytes(size as u64));
        let data = payload(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| blake3::hash(black_box(data)))
        });
    }
    group.finish();
}

fn bench_merkle_root(c: &mut Criterion) {
    let mut group = c.benchmark_group("merkle_root");
    for leaves in [16usize, 256, 4096] {
        let ids: Vec<String> = (0..leaves)
            .map(|i| blake3::hash(format!("leaf-{}", i).as_bytes()).to_hex().to_string())
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(leaves), &ids, |b, ids| {
            b.iter(|| MerkleTree::new(black_box(ids)).root())
        });
    }
    group.finish();
}

fn bench_compression(c: &mut Criterion) {
    let compressor = Compressor::new(1).expect("level 1 is valid");
    let data = payload(1 << 20);
    let mut group = c.benchmark_group("zstd");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("compress_1mib", |b| {
        b.iter(|| compressor.compress(black_box(&data)).expect("compress"))
    });
    let compressed = compressor.compress(&data).expect("compress");
    group.bench_function("decompress_1mib", |b| {
        b.iter(|| compressor.decompress(black_box(&compressed)).expect("decompress"))
    });
    group.finish();
}

criterion_group!(benches, bench_content_hash, bench_merkle_root, bench_compression);
criterion_main!(benches);
