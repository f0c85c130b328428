use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::engine::{EngineError, Version};
use crate::iterator::{DbIterator, MergingCursor, RecordCursor};
use crate::memtable::MemTable;
use crate::options::{MemTableConfig, WriteOptions};
use crate::record::{Record, RecordRef, SequenceNumber};
use crate::statistics::Statistics;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// An unlogged memtable holding `records`.
pub fn memtable(dir: &Path, id: u64, records: Vec<Record>) -> Arc<MemTable> {
    let (table, _) = MemTable::open(dir, id, &MemTableConfig::SkipList, None, true).unwrap();
    let opts = WriteOptions {
        disable_wal: true,
        ..WriteOptions::default()
    };
    for record in records {
        table.apply(record, &opts).unwrap();
    }
    Arc::new(table)
}

pub fn put(key: &str, value: &str, seq: SequenceNumber) -> Record {
    Record::put(key, value, seq)
}

pub fn del(key: &str, seq: SequenceNumber) -> Record {
    Record::tombstone(key, seq)
}

/// Merging cursor over `layers`, newest first.
pub fn merging(layers: &[Arc<MemTable>]) -> MergingCursor {
    MergingCursor::new(
        layers
            .iter()
            .map(|m| Box::new(m.cursor()) as Box<dyn RecordCursor>)
            .collect(),
    )
}

/// A user iterator at `sequence` over `layers` (newest first). The first
/// layer plays the active memtable.
pub fn db_iter(
    layers: &[Arc<MemTable>],
    sequence: SequenceNumber,
    stats: &Arc<Statistics>,
) -> DbIterator {
    let version = Arc::new(Version {
        active: Arc::clone(&layers[0]),
        frozen: layers[1..].to_vec(),
        tables: Vec::new(),
    });
    DbIterator::new(merging(layers), sequence, version, Arc::clone(stats))
}

pub fn forward(it: &mut DbIterator) -> Vec<(String, String)> {
    let mut out = Vec::new();
    it.seek_to_first();
    while it.valid() {
        out.push(entry(it));
        it.next();
    }
    out
}

pub fn backward(it: &mut DbIterator) -> Vec<(String, String)> {
    let mut out = Vec::new();
    it.seek_to_last();
    while it.valid() {
        out.push(entry(it));
        it.prev();
    }
    out
}

pub fn entry(it: &DbIterator) -> (String, String) {
    (
        String::from_utf8(it.key().unwrap().to_vec()).unwrap(),
        String::from_utf8(it.value().unwrap().to_vec()).unwrap(),
    )
}

pub fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
    items
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A cursor that is never valid and always reports a corruption.
pub struct BrokenCursor(EngineError);

impl BrokenCursor {
    pub fn new() -> Self {
        Self(EngineError::Corruption("broken block".into()))
    }
}

impl RecordCursor for BrokenCursor {
    fn current(&self) -> Option<RecordRef<'_>> {
        None
    }
    fn seek_to_first(&mut self) {}
    fn seek_to_last(&mut self) {}
    fn seek(&mut self, _key: &[u8], _seq: SequenceNumber) {}
    fn next(&mut self) {}
    fn prev(&mut self) {}
    fn status(&self) -> Option<&EngineError> {
        Some(&self.0)
    }
}
