//! In-memory write buffer.
//!
//! A [`MemTable`] buffers recent mutations in one of four interchangeable
//! representations selected by [`MemTableConfig`], and owns the WAL segment
//! that makes those mutations durable until they are flushed to a table.
//!
//! ## Concurrency
//!
//! The representation sits behind an `RwLock`. Writers are serialized by the
//! engine, so the lock only arbitrates between one writer and any number of
//! readers.
//!
//! Cursors hold no lock between calls. Over a skip list every step re-locks
//! and looks up the successor (or predecessor) of the last `(key, seq)` it
//! returned; records are never removed and sequence numbers are unique, so
//! that position stays well defined while new records arrive. The other
//! layouts have no cheap global successor, so their cursors take one sorted
//! copy on the first positioning call and step through it. Either way the
//! engine's iterator hides anything newer than its snapshot.
//!
//! ## Recovery
//!
//! [`MemTable::open`] replays the segment. A record cut short by a crash is
//! dropped along with everything after it. A record with a bad checksum is
//! fatal when `paranoid_checks` is on, otherwise it is treated the same way.


mod hash;
mod skiplist;
mod vector;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::engine::EngineError;
use crate::iterator::RecordCursor;
use crate::options::{MemTableConfig, WriteOptions};
use crate::record::{HexKey, MAX_SEQUENCE, Record, RecordRef, SequenceNumber, cmp_internal};
use crate::wal::{self, Wal, WalError};

use hash::{HashLinkedList, HashSkipList};
use skiplist::SkipList;
use vector::VectorRep;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum MemTableError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn poisoned<T>(_: T) -> MemTableError {
    MemTableError::Internal("RwLock poisoned".into())
}

// ------------------------------------------------------------------------------------------------
// Representation
// ------------------------------------------------------------------------------------------------

/// The closed set of memtable layouts.
pub(crate) enum MemTableRep {
    SkipList(SkipList),
    HashSkipList(HashSkipList),
    HashLinkedList(HashLinkedList),
    Vector(VectorRep),
}

impl MemTableRep {
    pub(crate) fn new(config: &MemTableConfig, prefix_len: Option<usize>) -> Self {
        match *config {
            MemTableConfig::SkipList => Self::SkipList(SkipList::new(
                MemTableConfig::DEFAULT_SKIPLIST_HEIGHT,
                MemTableConfig::DEFAULT_BRANCHING_FACTOR,
            )),
            MemTableConfig::HashSkipList {
                bucket_count,
                height,
                branching_factor,
            } => Self::HashSkipList(HashSkipList::new(
                bucket_count,
                height,
                branching_factor,
                prefix_len,
            )),
            MemTableConfig::HashLinkedList { bucket_count } => {
                Self::HashLinkedList(HashLinkedList::new(bucket_count, prefix_len))
            }
            MemTableConfig::Vector { reserved_size } => Self::Vector(VectorRep::new(reserved_size)),
        }
    }

    fn insert(&mut self, record: Record) {
        match self {
            Self::SkipList(rep) => rep.insert(record),
            Self::HashSkipList(rep) => rep.insert(record),
            Self::HashLinkedList(rep) => rep.insert(record),
            Self::Vector(rep) => rep.insert(record),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::SkipList(rep) => rep.len(),
            Self::HashSkipList(rep) => rep.len(),
            Self::HashLinkedList(rep) => rep.len(),
            Self::Vector(rep) => rep.len(),
        }
    }

    fn is_sorted(&self) -> bool {
        match self {
            Self::Vector(rep) => rep.is_sorted(),
            _ => true,
        }
    }

    fn sort(&mut self) {
        if let Self::Vector(rep) = self {
            rep.sort();
        }
    }

    /// Newest version of `key`. Never sorts.
    fn get(&self, key: &[u8]) -> Option<&Record> {
        match self {
            Self::SkipList(rep) => rep.find_ge(key, MAX_SEQUENCE).filter(|r| r.key == key),
            Self::HashSkipList(rep) => rep.get(key),
            Self::HashLinkedList(rep) => rep.get(key),
            Self::Vector(rep) => rep.get(key),
        }
    }

    fn sorted_records(&self) -> Vec<Record> {
        match self {
            Self::SkipList(rep) => rep.iter().cloned().collect(),
            Self::HashSkipList(rep) => rep.sorted(),
            Self::HashLinkedList(rep) => rep.sorted(),
            Self::Vector(rep) => rep.records().to_vec(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// MemTable
// ------------------------------------------------------------------------------------------------

/// Outcome of replaying a WAL segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub records: usize,
    pub max_seq: SequenceNumber,
    /// A damaged tail was discarded.
    pub truncated: bool,
}

pub struct MemTable {
    id: u64,
    rep: RwLock<MemTableRep>,
    /// Cursors step through the live skip list instead of a sorted copy.
    live_cursors: bool,
    wal: Wal<Record>,
    approximate_size: AtomicUsize,
    max_seq: AtomicU64,
    unlogged: AtomicBool,
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("id", &self.id)
            .field("approximate_size", &self.approximate_size())
            .finish_non_exhaustive()
    }
}

impl MemTable {
    /// Open segment `id` under `wal_dir`, replaying anything it holds.
    pub fn open(
        wal_dir: &Path,
        id: u64,
        config: &MemTableConfig,
        prefix_len: Option<usize>,
        paranoid_checks: bool,
    ) -> Result<(Self, ReplayStats), MemTableError> {
        let path = wal_dir.join(wal::segment_file_name(id));
        let wal: Wal<Record> = Wal::open(&path, None)?;
        let mut rep = MemTableRep::new(config, prefix_len);

        let mut stats = ReplayStats::default();
        let mut size = 0usize;
        let mut iter = wal.replay_iter();
        for item in iter.by_ref() {
            match item {
                Ok(record) => {
                    stats.records += 1;
                    stats.max_seq = stats.max_seq.max(record.seq);
                    size += record.charge();
                    rep.insert(record);
                }
                Err(WalError::UnexpectedEof(offset)) => {
                    warn!(wal_id = id, offset, "torn record at WAL tail, discarding");
                    stats.truncated = true;
                }
                Err(e @ (WalError::ChecksumMismatch(_) | WalError::Encoding(_))) => {
                    if paranoid_checks {
                        return Err(e.into());
                    }
                    warn!(wal_id = id, %e, "damaged WAL record, discarding tail");
                    stats.truncated = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
        if stats.truncated {
            wal.truncate_to(iter.position())?;
        }

        debug!(wal_id = id, records = stats.records, max_seq = stats.max_seq, "memtable opened");

        let table = Self {
            id,
            rep: RwLock::new(rep),
            live_cursors: matches!(config, MemTableConfig::SkipList),
            wal,
            approximate_size: AtomicUsize::new(size),
            max_seq: AtomicU64::new(stats.max_seq),
            unlogged: AtomicBool::new(false),
        };
        Ok((table, stats))
    }

    /// Log (unless disabled) and insert one record. Returns the WAL bytes
    /// written. Callers serialize writes.
    pub fn apply(&self, record: Record, opts: &WriteOptions) -> Result<usize, MemTableError> {
        trace!(
            memtable = self.id,
            seq = record.seq,
            key = %HexKey(&record.key),
            tombstone = record.is_tombstone(),
            "memtable apply"
        );

        let wal_bytes = if opts.disable_wal {
            self.unlogged.store(true, Ordering::Release);
            0
        } else {
            self.wal.append(&record, opts.sync)?
        };

        let charge = record.charge();
        self.max_seq.fetch_max(record.seq, Ordering::AcqRel);
        self.rep.write().map_err(poisoned)?.insert(record);
        self.approximate_size.fetch_add(charge, Ordering::AcqRel);
        Ok(wal_bytes)
    }

    /// Read access to a representation that is sorted, sorting it first if
    /// needed.
    fn sorted_rep(&self) -> Result<RwLockReadGuard<'_, MemTableRep>, MemTableError> {
        loop {
            let guard = self.rep.read().map_err(poisoned)?;
            if guard.is_sorted() {
                return Ok(guard);
            }
            drop(guard);
            self.rep.write().map_err(poisoned)?.sort();
        }
    }

    /// Newest record for `key`, tombstones included.
    pub fn get(&self, key: &[u8]) -> Result<Option<Record>, MemTableError> {
        Ok(self.rep.read().map_err(poisoned)?.get(key).cloned())
    }

    /// Every record, in internal order.
    pub fn sorted_records(&self) -> Result<Vec<Record>, MemTableError> {
        Ok(self.sorted_rep()?.sorted_records())
    }

    pub fn cursor(self: &Arc<Self>) -> MemTableCursor {
        let position = if self.live_cursors {
            Position::Live(None)
        } else {
            Position::Copy {
                records: None,
                index: None,
            }
        };
        MemTableCursor {
            table: Arc::clone(self),
            position,
            error: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn approximate_size(&self) -> usize {
        self.approximate_size.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.rep.read().map(|rep| rep.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_seq(&self) -> SequenceNumber {
        self.max_seq.load(Ordering::Acquire)
    }

    /// Whether any record was applied with the WAL disabled.
    pub fn has_unlogged_writes(&self) -> bool {
        self.unlogged.load(Ordering::Acquire)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.wal.path().to_path_buf()
    }

    pub fn sync_wal(&self) -> Result<(), MemTableError> {
        Ok(self.wal.sync()?)
    }
}

// ------------------------------------------------------------------------------------------------
// Cursor
// ------------------------------------------------------------------------------------------------

/// Lock-free-between-steps cursor over one memtable.
pub struct MemTableCursor {
    table: Arc<MemTable>,
    position: Position,
    error: Option<EngineError>,
}

enum Position {
    /// Last record returned from the live skip list.
    Live(Option<Record>),
    /// Sorted copy, taken by the first positioning call.
    Copy {
        records: Option<Vec<Record>>,
        index: Option<usize>,
    },
}

impl MemTableCursor {
    fn step_live(&mut self, find: impl FnOnce(&SkipList) -> Option<&Record>) {
        let found = self.table.rep.read().map_err(poisoned).map(|rep| match &*rep {
            MemTableRep::SkipList(list) => find(list).cloned(),
            _ => None,
        });
        match found {
            Ok(record) => self.position = Position::Live(record),
            Err(e) => {
                self.position = Position::Live(None);
                self.error = Some(e.into());
            }
        }
    }

    fn position_copy(&mut self, pick: impl FnOnce(&[Record]) -> Option<usize>) {
        let Position::Copy { records, index } = &mut self.position else {
            return;
        };
        if records.is_none() {
            match self.table.sorted_records() {
                Ok(sorted) => *records = Some(sorted),
                Err(e) => {
                    *index = None;
                    self.error = Some(e.into());
                    return;
                }
            }
        }
        *index = records.as_deref().and_then(pick);
    }

    fn reposition(
        &mut self,
        live: impl FnOnce(&SkipList) -> Option<&Record>,
        copy: impl FnOnce(&[Record]) -> Option<usize>,
    ) {
        match self.position {
            Position::Live(_) => self.step_live(live),
            Position::Copy { .. } => self.position_copy(copy),
        }
    }
}

impl RecordCursor for MemTableCursor {
    fn current(&self) -> Option<RecordRef<'_>> {
        match &self.position {
            Position::Live(record) => record.as_ref().map(Record::view),
            Position::Copy {
                records: Some(records),
                index: Some(idx),
            } => records.get(*idx).map(Record::view),
            Position::Copy { .. } => None,
        }
    }

    fn seek_to_first(&mut self) {
        self.reposition(SkipList::first, |records| {
            (!records.is_empty()).then_some(0)
        });
    }

    fn seek_to_last(&mut self) {
        self.reposition(SkipList::last, |records| records.len().checked_sub(1));
    }

    fn seek(&mut self, key: &[u8], seq: SequenceNumber) {
        self.reposition(
            |list| list.find_ge(key, seq),
            |records| {
                let idx = records
                    .partition_point(|r| cmp_internal(&r.key, r.seq, key, seq).is_lt());
                (idx < records.len()).then_some(idx)
            },
        );
    }

    fn next(&mut self) {
        match &mut self.position {
            Position::Live(current) => {
                if let Some(at) = current.take() {
                    self.step_live(|list| list.find_gt(&at.key, at.seq));
                }
            }
            Position::Copy { records, index } => {
                let len = records.as_ref().map_or(0, Vec::len);
                *index = index.map(|idx| idx + 1).filter(|&idx| idx < len);
            }
        }
    }

    fn prev(&mut self) {
        match &mut self.position {
            Position::Live(current) => {
                if let Some(at) = current.take() {
                    self.step_live(|list| list.find_lt(&at.key, at.seq));
                }
            }
            Position::Copy { index, .. } => {
                *index = index.and_then(|idx| idx.checked_sub(1));
            }
        }
    }

    fn status(&self) -> Option<&EngineError> {
        self.error.as_ref()
    }
}
