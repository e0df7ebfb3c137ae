mod common;

use std::sync::Arc;
use std::thread;

use granite::btree::BPlusTree;
use granite::transaction::Transaction;
use granite::{Rid, INVALID_PAGE_ID};
use rand::seq::SliceRandom;
use rand::SeedableRng;

fn rid_for(key: i64) -> Rid {
    Rid::new((key >> 16) as i32, (key & 0xFFFF) as u32)
}

fn collect_keys(tree: &BPlusTree<i64>) -> Vec<i64> {
    tree.iter().unwrap().map(|(k, _)| k).collect()
}

#[test]
fn grow_and_shrink_with_tiny_fanout() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let bpm = common::buffer_pool(&dir, 50);
    let tree = BPlusTree::<i64>::new("grow_shrink", Arc::clone(&bpm))
        .unwrap()
        .with_max_sizes(3, 3);

    assert!(tree.is_empty());
    assert!(collect_keys(&tree).is_empty());

    let txn = Transaction::new(1);
    for key in 1..=10 {
        assert!(tree.insert(key, rid_for(key), &txn).unwrap());
        let expected: Vec<i64> = (1..=key).collect();
        assert_eq!(collect_keys(&tree), expected, "after inserting {key}");
    }

    for key in 1..=10 {
        assert_eq!(tree.get_value(&key, None).unwrap(), vec![rid_for(key)]);
    }

    for key in (1..=10).rev() {
        tree.remove(&key, &txn).unwrap();
        let expected: Vec<i64> = (1..key).collect();
        assert_eq!(collect_keys(&tree), expected, "after removing {key}");
    }

    assert!(tree.is_empty());
    assert_eq!(tree.root_page_id(), INVALID_PAGE_ID);
}

#[test]
fn duplicate_keys_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let bpm = common::buffer_pool(&dir, 20);
    let tree = BPlusTree::<i64>::new("unique", bpm).unwrap();

    let txn = Transaction::new(1);
    assert!(tree.insert(42, Rid::new(1, 1), &txn).unwrap());
    assert!(!tree.insert(42, Rid::new(2, 2), &txn).unwrap());
    assert_eq!(tree.get_value(&42, None).unwrap(), vec![Rid::new(1, 1)]);
}

#[test]
fn missing_keys_read_as_empty() {
    let dir = tempfile::tempdir().unwrap();
    let bpm = common::buffer_pool(&dir, 20);
    let tree = BPlusTree::<i64>::new("missing", bpm).unwrap();

    assert!(tree.get_value(&7, None).unwrap().is_empty());

    let txn = Transaction::new(1);
    tree.insert(7, rid_for(7), &txn).unwrap();
    assert!(tree.get_value(&8, None).unwrap().is_empty());

    // Removing an absent key is a no-op.
    tree.remove(&8, &txn).unwrap();
    assert_eq!(tree.get_value(&7, None).unwrap(), vec![rid_for(7)]);
}

#[test]
fn range_scan_from_a_key() {
    let dir = tempfile::tempdir().unwrap();
    let bpm = common::buffer_pool(&dir, 50);
    let tree = BPlusTree::<i64>::new("range", bpm)
        .unwrap()
        .with_max_sizes(4, 4);

    let txn = Transaction::new(1);
    for key in (2..=40).step_by(2) {
        tree.insert(key, rid_for(key), &txn).unwrap();
    }

    // From an existing key.
    let from_10: Vec<i64> = tree.iter_from(&10).unwrap().map(|(k, _)| k).collect();
    assert_eq!(from_10, (10..=40).step_by(2).collect::<Vec<i64>>());

    // From a gap: starts at the next larger key.
    let from_11: Vec<i64> = tree.iter_from(&11).unwrap().map(|(k, _)| k).collect();
    assert_eq!(from_11, (12..=40).step_by(2).collect::<Vec<i64>>());

    // Past the end.
    assert_eq!(tree.iter_from(&99).unwrap().count(), 0);
}

#[test]
fn shuffled_workload_stays_consistent() {
    let dir = tempfile::tempdir().unwrap();
    let bpm = common::buffer_pool(&dir, 64);
    let tree = BPlusTree::<i64>::new("shuffled", bpm)
        .unwrap()
        .with_max_sizes(5, 5);

    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED);
    let mut keys: Vec<i64> = (1..=300).collect();
    keys.shuffle(&mut rng);

    let txn = Transaction::new(1);
    for &key in &keys {
        assert!(tree.insert(key, rid_for(key), &txn).unwrap());
    }
    assert_eq!(collect_keys(&tree), (1..=300).collect::<Vec<i64>>());

    let (to_remove, to_keep) = keys.split_at(150);
    for &key in to_remove {
        tree.remove(&key, &txn).unwrap();
    }
    for &key in to_remove {
        assert!(tree.get_value(&key, None).unwrap().is_empty());
    }
    let mut kept: Vec<i64> = to_keep.to_vec();
    kept.sort_unstable();
    assert_eq!(collect_keys(&tree), kept);
}

#[test]
fn concurrent_inserts_from_many_threads() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let bpm = common::buffer_pool(&dir, 64);
    let tree = Arc::new(
        BPlusTree::<i64>::new("concurrent_insert", bpm)
            .unwrap()
            .with_max_sizes(5, 5),
    );

    const THREADS: i64 = 4;
    const PER_THREAD: i64 = 150;

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || {
            let txn = Transaction::new(t as i32);
            for i in 0..PER_THREAD {
                let key = t * PER_THREAD + i;
                assert!(tree.insert(key, rid_for(key), &txn).unwrap());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let expected: Vec<i64> = (0..THREADS * PER_THREAD).collect();
    assert_eq!(collect_keys(&tree), expected);
    for key in 0..THREADS * PER_THREAD {
        assert_eq!(tree.get_value(&key, None).unwrap(), vec![rid_for(key)]);
    }
}

#[test]
fn concurrent_deletes_of_disjoint_ranges() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let bpm = common::buffer_pool(&dir, 64);
    let tree = Arc::new(
        BPlusTree::<i64>::new("concurrent_delete", bpm)
            .unwrap()
            .with_max_sizes(5, 5),
    );

    let setup = Transaction::new(99);
    for key in 0..400 {
        tree.insert(key, rid_for(key), &setup).unwrap();
    }

    // Three threads each delete a stripe, leaving every fourth key.
    let mut handles = Vec::new();
    for t in 1..=3i64 {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || {
            let txn = Transaction::new(t as i32);
            for key in (0..400).filter(|k| k % 4 == t) {
                tree.remove(&key, &txn).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let expected: Vec<i64> = (0..400).filter(|k| k % 4 == 0).collect();
    assert_eq!(collect_keys(&tree), expected);
}

#[test]
fn root_id_survives_reopening_the_index() {
    let dir = tempfile::tempdir().unwrap();
    let bpm = common::buffer_pool(&dir, 50);

    let root_before = {
        let tree = BPlusTree::<i64>::new("reopened", Arc::clone(&bpm)).unwrap();
        let txn = Transaction::new(1);
        for key in 1..=50 {
            tree.insert(key, rid_for(key), &txn).unwrap();
        }
        tree.root_page_id()
    };

    let tree = BPlusTree::<i64>::new("reopened", bpm).unwrap();
    assert_eq!(tree.root_page_id(), root_before);
    for key in 1..=50 {
        assert_eq!(tree.get_value(&key, None).unwrap(), vec![rid_for(key)]);
    }
}
