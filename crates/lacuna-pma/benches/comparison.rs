use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lacuna_pma::PackedMemoryArray;
use rand::prelude::*;
use std::collections::BTreeMap;

fn bench_insert_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_sequential");

    for size in [1000i64, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::new("PackedMemoryArray", size), &size, |b, &size| {
            b.iter(|| {
                let mut pma = PackedMemoryArray::with_defaults().unwrap();
                for i in 0..size {
                    pma.insert(i, i).unwrap();
                }
                black_box(pma)
            });
        });

        group.bench_with_input(BenchmarkId::new("BTreeMap", size), &size, |b, &size| {
            b.iter(|| {
                let mut map = BTreeMap::new();
                for i in 0..size {
                    map.insert(i, i);
                }
                black_box(map)
            });
        });
    }

    group.finish();
}

fn bench_insert_random(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_random");

    for size in [1000usize, 10_000, 100_000] {
        let mut rng = StdRng::seed_from_u64(42);
        let mut keys: Vec<i64> = (0..size as i64).collect();
        keys.shuffle(&mut rng);

        group.bench_with_input(BenchmarkId::new("PackedMemoryArray", size), &keys, |b, keys| {
            b.iter(|| {
                let mut pma = PackedMemoryArray::with_defaults().unwrap();
                for &key in keys {
                    pma.insert(key, key).unwrap();
                }
                black_box(pma)
            });
        });

        group.bench_with_input(BenchmarkId::new("BTreeMap", size), &keys, |b, keys| {
            b.iter(|| {
                let mut map = BTreeMap::new();
                for &key in keys {
                    map.insert(key, key);
                }
                black_box(map)
            });
        });
    }

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");

    for size in [1000i64, 100_000] {
        let mut pma = PackedMemoryArray::with_defaults().unwrap();
        let mut map = BTreeMap::new();
        for i in 0..size {
            pma.insert(i, i).unwrap();
            map.insert(i, i);
        }

        group.bench_with_input(BenchmarkId::new("PackedMemoryArray", size), &size, |b, &size| {
            b.iter(|| {
                for i in 0..size {
                    black_box(pma.get(i));
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("BTreeMap", size), &size, |b, &size| {
            b.iter(|| {
                for i in 0..size {
                    black_box(map.get(&i));
                }
            });
        });
    }

    group.finish();
}

fn bench_range_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_scan");

    for size in [10_000i64, 100_000] {
        let mut pma = PackedMemoryArray::with_defaults().unwrap();
        let mut map = BTreeMap::new();
        for i in 0..size {
            pma.insert(i, i).unwrap();
            map.insert(i, i);
        }
        let lo = size / 4;
        let hi = 3 * size / 4;

        group.bench_with_input(BenchmarkId::new("PackedMemoryArray", size), &size, |b, _| {
            b.iter(|| {
                let mut acc = 0i64;
                for (k, _) in pma.range(lo, hi) {
                    acc = acc.wrapping_add(k);
                }
                black_box(acc)
            });
        });

        group.bench_with_input(BenchmarkId::new("BTreeMap", size), &size, |b, _| {
            b.iter(|| {
                let mut acc = 0i64;
                for (&k, _) in map.range(lo..=hi) {
                    acc = acc.wrapping_add(k);
                }
                black_box(acc)
            });
        });
    }

    group.finish();
}

fn bench_bulk_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulk_load");

    for size in [10_000i64, 100_000] {
        let batch: Vec<(i64, i64)> = (0..size).map(|i| (i * 2, i)).collect();

        group.bench_with_input(BenchmarkId::new("PackedMemoryArray", size), &batch, |b, batch| {
            b.iter(|| {
                let mut pma = PackedMemoryArray::with_defaults().unwrap();
                pma.load_sorted(batch).unwrap();
                black_box(pma)
            });
        });

        group.bench_with_input(BenchmarkId::new("BTreeMap", size), &batch, |b, batch| {
            b.iter(|| {
                let mut map = BTreeMap::new();
                for &(k, v) in batch {
                    map.insert(k, v);
                }
                black_box(map)
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_insert_sequential,
    bench_insert_random,
    bench_lookup,
    bench_range_scan,
    bench_bulk_load,
);

criterion_main!(benches);
