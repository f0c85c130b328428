//! Append-only vector representation.
//!
//! Inserts push to the end and only clear the `sorted` flag when they land
//! out of order. Point lookups never sort: they binary-search a sorted
//! vector and scan an unsorted one. The vector is sorted in place when a
//! flush or a cursor first asks for ordered records, so a frozen memtable
//! sorts at most once.

use crate::record::{MAX_SEQUENCE, Record, cmp_internal};

pub(crate) struct VectorRep {
    records: Vec<Record>,
    sorted: bool,
}

impl VectorRep {
    pub(crate) fn new(reserved_size: usize) -> Self {
        Self {
            records: Vec::with_capacity(reserved_size),
            sorted: true,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn insert(&mut self, record: Record) {
        if self.sorted && self.records.last().is_some_and(|last| record < *last) {
            self.sorted = false;
        }
        self.records.push(record);
    }

    pub(crate) fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub(crate) fn sort(&mut self) {
        if !self.sorted {
            self.records.sort_unstable();
            self.sorted = true;
        }
    }

    /// Newest version of `key`.
    pub(crate) fn get(&self, key: &[u8]) -> Option<&Record> {
        if self.sorted {
            let idx = self
                .records
                .partition_point(|r| cmp_internal(&r.key, r.seq, key, MAX_SEQUENCE).is_lt());
            return self.records.get(idx).filter(|r| r.key == key);
        }
        self.records
            .iter()
            .filter(|r| r.key == key)
            .max_by_key(|r| r.seq)
    }

    /// Requires `is_sorted()`; `MemTable` sorts first.
    pub(crate) fn records(&self) -> &[Record] {
        &self.records
    }
}
