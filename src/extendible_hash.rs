//! In-memory extendible hash table.
//!
//! The buffer pool uses this as its page table: a directory of 2^G slots
//! addressed by the low G bits of the key's hash, each slot pointing at a
//! bucket of bounded capacity. Overflowing a bucket splits it, doubling the
//! directory when the bucket's local depth outgrows the global depth.
//! Buckets are never merged and the directory never shrinks.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;

/// Hasher that maps integer keys to their own value, so directory
/// addressing by low bits matches the key's low bits. Non-integer input is
/// folded FNV-style.
#[derive(Default)]
struct SelfHasher {
    state: u64,
}

impl Hasher for SelfHasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.state = (self.state ^ b as u64).wrapping_mul(0x100_0000_01b3);
        }
    }

    fn write_u8(&mut self, v: u8) {
        self.state = v as u64;
    }
    fn write_u16(&mut self, v: u16) {
        self.state = v as u64;
    }
    fn write_u32(&mut self, v: u32) {
        self.state = v as u64;
    }
    fn write_u64(&mut self, v: u64) {
        self.state = v;
    }
    fn write_usize(&mut self, v: usize) {
        self.state = v as u64;
    }
    fn write_i8(&mut self, v: i8) {
        self.state = v as u8 as u64;
    }
    fn write_i16(&mut self, v: i16) {
        self.state = v as u16 as u64;
    }
    fn write_i32(&mut self, v: i32) {
        self.state = v as u32 as u64;
    }
    fn write_i64(&mut self, v: i64) {
        self.state = v as u64;
    }
    fn write_isize(&mut self, v: isize) {
        self.state = v as u64;
    }
}

fn hash_of<K: Hash>(key: &K) -> u64 {
    let mut hasher = SelfHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}

struct Bucket<K, V> {
    records: HashMap<K, V>,
    local_depth: u32,
}

impl<K, V> Bucket<K, V> {
    fn new(local_depth: u32) -> Self {
        Self {
            records: HashMap::new(),
            local_depth,
        }
    }
}

struct Inner<K, V> {
    /// Slot -> index into `buckets`. Multiple slots may share a bucket
    /// whose local depth is below the global depth.
    directory: Vec<usize>,
    /// Bucket arena; buckets are created by splits and never removed.
    buckets: Vec<Bucket<K, V>>,
    global_depth: u32,
}

pub struct ExtendibleHashTable<K, V> {
    inner: Mutex<Inner<K, V>>,
    bucket_capacity: usize,
}

impl<K: Hash + Eq + Clone, V: Clone> ExtendibleHashTable<K, V> {
    /// `bucket_capacity` is the number of records a bucket holds before an
    /// insert forces a split.
    pub fn new(bucket_capacity: usize) -> Self {
        assert!(bucket_capacity > 0);
        Self {
            inner: Mutex::new(Inner {
                directory: vec![0],
                buckets: vec![Bucket::new(0)],
                global_depth: 0,
            }),
            bucket_capacity,
        }
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let inner = self.inner.lock();
        let bucket = inner.directory[inner.slot_of(key)];
        inner.buckets[bucket].records.get(key).cloned()
    }

    pub fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        let bucket = inner.directory[inner.slot_of(key)];
        inner.buckets[bucket].records.remove(key).is_some()
    }

    /// Inserts or overwrites. A bucket pushed past capacity is split; the
    /// split may cascade the local depth up several bits when colliding
    /// suffixes keep every record on one side.
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        let bucket = inner.directory[inner.slot_of(&key)];
        inner.buckets[bucket].records.insert(key, value);
        if inner.buckets[bucket].records.len() > self.bucket_capacity {
            inner.split(bucket);
        }
    }

    pub fn global_depth(&self) -> u32 {
        self.inner.lock().global_depth
    }

    /// Local depth of the bucket referenced by directory slot `slot`.
    pub fn local_depth(&self, slot: usize) -> Option<u32> {
        let inner = self.inner.lock();
        let bucket = *inner.directory.get(slot)?;
        Some(inner.buckets[bucket].local_depth)
    }

    pub fn num_buckets(&self) -> usize {
        self.inner.lock().buckets.len()
    }

    pub fn directory_size(&self) -> usize {
        self.inner.lock().directory.len()
    }
}

impl<K: Hash + Eq + Clone, V: Clone> Inner<K, V> {
    fn slot_of(&self, key: &K) -> usize {
        (hash_of(key) & ((1u64 << self.global_depth) - 1)) as usize
    }

    fn split(&mut self, bucket: usize) {
        let mut depth = self.buckets[bucket].local_depth;
        let mut moved: HashMap<K, V> = HashMap::new();

        // Partition on successively higher bits until both sides are
        // non-empty; a run of colliding suffixes can skip several depths.
        loop {
            depth += 1;
            let bit = 1u64 << (depth - 1);
            let records = std::mem::take(&mut self.buckets[bucket].records);
            for (k, v) in records {
                if hash_of(&k) & bit != 0 {
                    moved.insert(k, v);
                } else {
                    self.buckets[bucket].records.insert(k, v);
                }
            }
            if self.buckets[bucket].records.is_empty() {
                std::mem::swap(&mut self.buckets[bucket].records, &mut moved);
            }
            if !moved.is_empty() {
                break;
            }
        }

        self.buckets[bucket].local_depth = depth;
        let new_bucket = self.buckets.len();
        self.buckets.push(Bucket {
            records: moved,
            local_depth: depth,
        });

        while self.global_depth < depth {
            // The upper half of the doubled directory mirrors the lower.
            self.directory.extend_from_within(..);
            self.global_depth += 1;
        }

        // Slots previously aimed at the split bucket are re-aimed at the new
        // bucket exactly where their low `depth` bits match its signature.
        let mask = (1u64 << depth) - 1;
        let sample = self.buckets[new_bucket]
            .records
            .keys()
            .next()
            .expect("split always produces a non-empty bucket");
        let new_signature = (hash_of(sample) & mask) as usize;
        for slot in 0..self.directory.len() {
            if self.directory[slot] == bucket && slot & mask as usize == new_signature {
                self.directory[slot] = new_bucket;
            }
        }
    }
}
