//! Benchmarks for VirtaKV data source operations

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::TempDir;
use virtakv::{
    Config, DataSource, Database, DigestType, Hash, HashRecord, LeafRecord, TableConfig,
};

const LEAF_COUNT: i64 = 1000;

fn bench_source() -> (TempDir, DataSource) {
    let temp_dir = TempDir::new().unwrap();
    let database = Database::open(temp_dir.path(), Config::builder().build()).unwrap();
    let table_config = TableConfig::new(1, DigestType::Sha384)
        .max_number_of_keys(1_000_000)
        .unwrap()
        .hashes_ram_to_disk_threshold(LEAF_COUNT / 2)
        .unwrap();
    let source = database
        .create_data_source("bench", table_config, false)
        .unwrap();
    (temp_dir, source)
}

fn key_hash(key: &[u8]) -> i32 {
    key.iter()
        .fold(17i32, |acc, b| acc.wrapping_mul(31).wrapping_add(*b as i32))
}

fn batch(first: i64, last: i64, generation: u8) -> (Vec<HashRecord>, Vec<LeafRecord>) {
    let hashes = (0..=last)
        .map(|p| {
            let digest = Hash::new(
                DigestType::Sha384,
                Bytes::from(vec![(p % 251) as u8 ^ generation; 48]),
            )
            .unwrap();
            HashRecord::new(p, digest)
        })
        .collect();
    let leaves = (first..=last)
        .map(|p| {
            let key = format!("key-{:08}", p).into_bytes();
            let hash_code = key_hash(&key);
            LeafRecord::new(
                p,
                Bytes::from(key),
                hash_code,
                Some(Bytes::from(vec![generation; 128])),
            )
        })
        .collect();
    (hashes, leaves)
}

fn datasource_benchmarks(c: &mut Criterion) {
    let (_temp, source) = bench_source();
    let first = LEAF_COUNT - 1;
    let last = 2 * LEAF_COUNT - 2;

    let mut generation = 0u8;
    c.bench_function("save_records_1000_leaves", |b| {
        b.iter(|| {
            generation = generation.wrapping_add(1);
            let (hashes, leaves) = batch(first, last, generation);
            source
                .save_records(first, last, hashes, leaves, vec![], false)
                .unwrap();
        })
    });

    let mut path = first;
    c.bench_function("load_leaf_record_by_path", |b| {
        b.iter(|| {
            path = if path >= last { first } else { path + 1 };
            black_box(source.load_leaf_record(path).unwrap())
        })
    });

    let mut path = first;
    c.bench_function("load_leaf_record_by_key", |b| {
        b.iter(|| {
            path = if path >= last { first } else { path + 1 };
            let key = Bytes::from(format!("key-{:08}", path).into_bytes());
            let hash_code = key_hash(&key);
            black_box(source.load_leaf_record_by_key(&key, hash_code).unwrap())
        })
    });

    let mut path = 0;
    c.bench_function("load_hash", |b| {
        b.iter(|| {
            path = if path >= last { 0 } else { path + 1 };
            black_box(source.load_hash(path).unwrap())
        })
    });

    source.close(false).unwrap();
}

criterion_group!(benches, datasource_benchmarks);
criterion_main!(benches);
