//! Prefix-hashed memtable representations.
//!
//! Keys are routed to a bucket by hashing their prefix (the first
//! `fixed_prefix_len` bytes, or the whole key). Buckets are created lazily,
//! so a configured bucket count in the millions costs nothing until used.
//!
//! Point lookups touch a single bucket. Buckets are not ordered against
//! each other, so ordered traversal works on a sorted copy built from every
//! live bucket once per cursor.

use std::collections::HashMap;

use crate::memtable::skiplist::SkipList;
use crate::record::Record;

fn bucket_of(key: &[u8], prefix_len: Option<usize>, bucket_count: usize) -> usize {
    let prefix = match prefix_len {
        Some(len) if key.len() > len => &key[..len],
        _ => key,
    };
    crc32fast::hash(prefix) as usize % bucket_count
}

// ------------------------------------------------------------------------------------------------
// HashSkipList
// ------------------------------------------------------------------------------------------------

pub(crate) struct HashSkipList {
    buckets: HashMap<usize, SkipList>,
    bucket_count: usize,
    height: usize,
    branching_factor: usize,
    prefix_len: Option<usize>,
    len: usize,
}

impl HashSkipList {
    pub(crate) fn new(
        bucket_count: usize,
        height: usize,
        branching_factor: usize,
        prefix_len: Option<usize>,
    ) -> Self {
        Self {
            buckets: HashMap::new(),
            bucket_count: bucket_count.max(1),
            height,
            branching_factor,
            prefix_len,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn insert(&mut self, record: Record) {
        let bucket = bucket_of(&record.key, self.prefix_len, self.bucket_count);
        let (height, branching) = (self.height, self.branching_factor);
        self.buckets
            .entry(bucket)
            .or_insert_with(|| SkipList::new(height, branching))
            .insert(record);
        self.len += 1;
    }

    /// Newest version of `key`, looking only at its bucket.
    pub(crate) fn get(&self, key: &[u8]) -> Option<&Record> {
        let bucket = bucket_of(key, self.prefix_len, self.bucket_count);
        self.buckets
            .get(&bucket)?
            .find_ge(key, u64::MAX)
            .filter(|record| record.key == key)
    }

    /// Every record in internal order. Each bucket is already a sorted run,
    /// which the stable merge sort picks up as-is.
    pub(crate) fn sorted(&self) -> Vec<Record> {
        let mut all = Vec::with_capacity(self.len);
        for list in self.buckets.values() {
            all.extend(list.iter().cloned());
        }
        all.sort();
        all
    }
}

// ------------------------------------------------------------------------------------------------
// HashLinkedList
// ------------------------------------------------------------------------------------------------

/// Buckets hold records in arrival order; nothing inside a bucket is sorted.
pub(crate) struct HashLinkedList {
    buckets: HashMap<usize, Vec<Record>>,
    bucket_count: usize,
    prefix_len: Option<usize>,
    len: usize,
}

impl HashLinkedList {
    pub(crate) fn new(bucket_count: usize, prefix_len: Option<usize>) -> Self {
        Self {
            buckets: HashMap::new(),
            bucket_count: bucket_count.max(1),
            prefix_len,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn insert(&mut self, record: Record) {
        let bucket = bucket_of(&record.key, self.prefix_len, self.bucket_count);
        self.buckets.entry(bucket).or_default().push(record);
        self.len += 1;
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<&Record> {
        let bucket = bucket_of(key, self.prefix_len, self.bucket_count);
        self.buckets
            .get(&bucket)?
            .iter()
            .filter(|record| record.key == key)
            .max_by_key(|record| record.seq)
    }

    pub(crate) fn sorted(&self) -> Vec<Record> {
        let mut all: Vec<Record> = self.buckets.values().flatten().cloned().collect();
        all.sort_unstable();
        all
    }
}
