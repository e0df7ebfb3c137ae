use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use granite::btree::BPlusTree;
use granite::buffer_pool::BufferPoolManager;
use granite::disk::DiskManager;
use granite::transaction::Transaction;
use granite::Rid;
use tempfile::TempDir;

fn make_pool(dir: &TempDir) -> Arc<BufferPoolManager> {
    let disk = Arc::new(
        DiskManager::open(dir.path().join("bench.db"), dir.path().join("bench.log")).unwrap(),
    );
    Arc::new(BufferPoolManager::new(256, disk, None))
}

fn bench_insert(c: &mut Criterion) {
    c.bench_function("btree_insert_1k", |b| {
        b.iter_batched(
            || {
                let dir = tempfile::tempdir().unwrap();
                let bpm = make_pool(&dir);
                let tree = BPlusTree::<i64>::new("bench", bpm).unwrap();
                (dir, tree)
            },
            |(_dir, tree)| {
                let txn = Transaction::new(1);
                for key in 0..1_000i64 {
                    tree.insert(key, Rid::new(1, key as u32), &txn).unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_lookup(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let bpm = make_pool(&dir);
    let tree = BPlusTree::<i64>::new("bench", bpm).unwrap();
    let txn = Transaction::new(1);
    for key in 0..10_000i64 {
        tree.insert(key, Rid::new(1, key as u32), &txn).unwrap();
    }

    let mut probe = 0i64;
    c.bench_function("btree_lookup", |b| {
        b.iter(|| {
            probe = (probe + 7_919) % 10_000;
            tree.get_value(&probe, None).unwrap()
        });
    });
}

criterion_group!(benches, bench_insert, bench_lookup);
criterion_main!(benches);
