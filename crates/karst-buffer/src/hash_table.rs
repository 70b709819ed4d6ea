//! Extendible hash table used as the buffer pool's page directory.

use parking_lot::Mutex;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use tracing::debug;

struct Bucket<K, V> {
    /// Number of low hash bits shared by every key in this bucket.
    local_depth: usize,
    items: Vec<(K, V)>,
}

struct TableInner<K, V> {
    /// Number of low hash bits addressing the directory.
    global_depth: usize,
    /// Bounded capacity of each bucket.
    bucket_size: usize,
    /// 2^global_depth slots, each referencing a bucket in `buckets`.
    /// Multiple slots alias one bucket while its local depth lags behind.
    directory: Vec<usize>,
    /// Bucket slab; buckets are created by splits and never freed.
    buckets: Vec<Bucket<K, V>>,
}

/// Dynamic associative mapping with bucket splits and directory doubling.
///
/// The directory slot for a key is the low `global_depth` bits of its hash.
/// When a bucket overflows it splits: its local depth grows by one, a
/// sibling bucket takes the entries whose next hash bit is set, and either
/// the sibling is installed into the matching directory slots or, if the
/// new local depth exceeds the global depth, the directory doubles first.
///
/// A single table-wide mutex guards all operations. No shrinkage is
/// performed on removal.
pub struct ExtendibleHashTable<K, V, S = RandomState> {
    hasher: S,
    inner: Mutex<TableInner<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> ExtendibleHashTable<K, V> {
    /// Creates a table whose buckets hold at most `bucket_size` entries.
    pub fn new(bucket_size: usize) -> Self {
        Self::with_hasher(bucket_size, RandomState::new())
    }
}

impl<K: Hash + Eq + Clone, V: Clone, S: BuildHasher> ExtendibleHashTable<K, V, S> {
    /// Creates a table with a caller-supplied hasher.
    pub fn with_hasher(bucket_size: usize, hasher: S) -> Self {
        assert!(bucket_size > 0, "bucket size must be positive");
        Self {
            hasher,
            inner: Mutex::new(TableInner {
                global_depth: 0,
                bucket_size,
                directory: vec![0],
                buckets: vec![Bucket {
                    local_depth: 0,
                    items: Vec::new(),
                }],
            }),
        }
    }

    fn hash(&self, key: &K) -> u64 {
        self.hasher.hash_one(key)
    }

    fn slot_of(hash: u64, global_depth: usize) -> usize {
        (hash as usize) & ((1usize << global_depth) - 1)
    }

    /// Associates `value` with `key`, replacing any existing value.
    pub fn insert(&self, key: K, value: V) {
        let hash = self.hash(&key);
        let mut inner = self.inner.lock();

        loop {
            let slot = Self::slot_of(hash, inner.global_depth);
            let bucket_idx = inner.directory[slot];
            let bucket_size = inner.bucket_size;
            let bucket = &mut inner.buckets[bucket_idx];

            if let Some(entry) = bucket.items.iter_mut().find(|(k, _)| *k == key) {
                entry.1 = value;
                return;
            }
            if bucket.items.len() < bucket_size {
                bucket.items.push((key, value));
                return;
            }

            self.split_bucket(&mut inner, bucket_idx);
        }
    }

    /// Splits an overflowing bucket, doubling the directory when the new
    /// local depth exceeds the global depth.
    fn split_bucket(&self, inner: &mut TableInner<K, V>, bucket_idx: usize) {
        let new_depth = inner.buckets[bucket_idx].local_depth + 1;

        if new_depth > inner.global_depth {
            inner.directory.extend_from_within(..);
            inner.global_depth += 1;
            debug!(
                global_depth = inner.global_depth,
                slots = inner.directory.len(),
                "hash directory doubled"
            );
        }

        inner.buckets[bucket_idx].local_depth = new_depth;
        let sibling_idx = inner.buckets.len();
        inner.buckets.push(Bucket {
            local_depth: new_depth,
            items: Vec::new(),
        });

        // Entries whose bit (new_depth - 1) is set move to the sibling
        let items = std::mem::take(&mut inner.buckets[bucket_idx].items);
        for (k, v) in items {
            let dest = if (self.hash(&k) >> (new_depth - 1)) & 1 == 1 {
                sibling_idx
            } else {
                bucket_idx
            };
            inner.buckets[dest].items.push((k, v));
        }

        // Redirect the aliasing slots whose pattern now matches the sibling
        for slot in 0..inner.directory.len() {
            if inner.directory[slot] == bucket_idx && (slot >> (new_depth - 1)) & 1 == 1 {
                inner.directory[slot] = sibling_idx;
            }
        }
    }

    /// Returns the value stored for `key`, if any.
    pub fn find(&self, key: &K) -> Option<V> {
        let hash = self.hash(key);
        let inner = self.inner.lock();

        let slot = Self::slot_of(hash, inner.global_depth);
        let bucket = &inner.buckets[inner.directory[slot]];
        bucket
            .items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Removes the entry for `key`, returning whether it existed.
    pub fn remove(&self, key: &K) -> bool {
        let hash = self.hash(key);
        let mut inner = self.inner.lock();

        let slot = Self::slot_of(hash, inner.global_depth);
        let bucket_idx = inner.directory[slot];
        let bucket = &mut inner.buckets[bucket_idx];
        match bucket.items.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                bucket.items.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Returns the number of low hash bits addressing the directory.
    pub fn global_depth(&self) -> usize {
        self.inner.lock().global_depth
    }

    /// Returns the local depth of the bucket referenced by a directory slot.
    pub fn local_depth(&self, slot: usize) -> usize {
        let inner = self.inner.lock();
        inner.buckets[inner.directory[slot]].local_depth
    }

    /// Returns the number of distinct buckets.
    pub fn num_buckets(&self) -> usize {
        self.inner.lock().buckets.len()
    }

    /// Returns the number of directory slots (2^global_depth).
    pub fn directory_size(&self) -> usize {
        self.inner.lock().directory.len()
    }

    /// Returns the number of stored entries.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.buckets.iter().map(|b| b.items.len()).sum()
    }

    /// Returns true when no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
