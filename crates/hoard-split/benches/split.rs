use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use hoard_split::{find_split, HashSplitter, SplitConfig};
use hoard_store::InMemoryObjectStore;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::io::Cursor;

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(1).fill_bytes(&mut data);
    data
}

fn bench_find_split(c: &mut Criterion) {
    let data = random_bytes(1 << 20);
    let mut group = c.benchmark_group("rollsum");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("find_split_1mib", |b| {
        b.iter(|| {
            let mut rest = black_box(&data[..]);
            while let Some((ofs, _)) = find_split(rest, 13) {
                rest = &rest[ofs..];
            }
        })
    });
    group.finish();
}

fn bench_split_to_tree(c: &mut Criterion) {
    let data = random_bytes(8 << 20);
    let config = SplitConfig::default();
    let mut group = c.benchmark_group("splitter");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("split_to_blob_or_tree_8mib", |b| {
        b.iter(|| {
            let mut store = InMemoryObjectStore::new();
            let splitter = HashSplitter::new([Cursor::new(&data[..])], &config).unwrap();
            hoard_split::split_to_blob_or_tree(&mut store, splitter, config.max_per_tree).unwrap()
        })
    });
    group.finish();
}

criterion_group!(benches, bench_find_split, bench_split_to_tree);
criterion_main!(benches);
