//! # LSM Storage Engine
//!
//! The engine keeps three layers, queried newest-first:
//!
//! 1. **Active memtable**: takes every write, backed by its own WAL segment.
//! 2. **Frozen memtables**: full memtables waiting for a flush, still readable.
//! 3. **Tables**: immutable on-disk runs, newest first.
//!
//! ## Versions
//!
//! The current set of layers is an immutable [`Version`] behind an
//! `RwLock<Arc<Version>>`. Readers clone the `Arc` and work against that
//! snapshot with no further locking; freezes, flushes and compactions build
//! a new `Version` and swap it in. A table stays on disk for as long as any
//! version, iterator or compaction still holds its handle.
//!
//! ## Locks
//!
//! Acquired in this order when nested: `writer`, `manifest`, `version`.
//! Flushes are serialized by `flush_lock` and build their table without any
//! of the others held.
//!
//! ## Sequence numbers
//!
//! Writers are serialized by `writer`, which also assigns sequence numbers
//! (starting at 1). `last_sequence` is published only after the record is in
//! the memtable, so an iterator reading at that sequence sees every write up
//! to it.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, RwLockWriteGuard};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::DbError;
use crate::compaction::{self, CompactionPick, CompactionReason};
use crate::iterator::{DbIterator, MergingCursor, RecordCursor};
use crate::manifest::{Manifest, ManifestError, TableMeta};
use crate::memtable::{MemTable, MemTableError, ReplayStats};
use crate::options::{DbOptions, ReadOptions, WriteOptions};
use crate::record::{HexKey, Record, SequenceNumber};
use crate::statistics::{HistogramType, Statistics, Ticker};
use crate::table::{
    self, BlockCache, TableBuildOptions, TableError, TableHandle, TableLookup, TableReadContext,
};
use crate::wal::{self, WalError};

#[cfg(test)]
mod tests;

pub const MANIFEST_DIR: &str = "manifest";
pub const WAL_DIR: &str = "wal";
pub const TABLE_DIR: &str = "tables";

/// Manifest events between two automatic checkpoints.
const CHECKPOINT_INTERVAL: u64 = 64;

/// How long a stalled writer sleeps before re-checking for room.
const STALL_POLL: Duration = Duration::from_millis(10);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Memtable error: {0}")]
    MemTable(#[from] MemTableError),

    #[error("Table error: {0}")]
    Table(#[from] TableError),

    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// On-disk state disagrees with the manifest.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// The engine is shutting down.
    #[error("Engine is closing")]
    Closing,

    /// Internal invariant violation (poisoned lock, unexpected state, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

fn copy_io(e: &io::Error) -> DbError {
    DbError::Io(io::Error::new(e.kind(), e.to_string()))
}

fn classify_wal(e: &WalError) -> DbError {
    match e {
        WalError::Io(io) => copy_io(io),
        WalError::RecordTooLarge(_) => DbError::InvalidArgument(e.to_string()),
        WalError::Internal(msg) => DbError::Internal(msg.clone()),
        _ => DbError::Corruption(e.to_string()),
    }
}

impl EngineError {
    /// Map into the public error taxonomy.
    pub fn to_db_error(&self) -> DbError {
        match self {
            Self::Wal(e) | Self::MemTable(MemTableError::Wal(e)) | Self::Manifest(ManifestError::Wal(e)) => {
                classify_wal(e)
            }
            Self::MemTable(MemTableError::Internal(msg)) => DbError::Internal(msg.clone()),
            Self::Manifest(ManifestError::Io(e)) | Self::Table(TableError::Io(e)) | Self::Io(e) => {
                copy_io(e)
            }
            Self::Manifest(e @ (ManifestError::Encoding(_) | ManifestError::SnapshotCorrupted(_))) => {
                DbError::Corruption(e.to_string())
            }
            Self::Table(e @ (TableError::Encoding(_) | TableError::Corruption(_))) => {
                DbError::Corruption(e.to_string())
            }
            Self::Table(e @ TableError::Filter(_)) => DbError::Internal(e.to_string()),
            Self::Manifest(ManifestError::Internal(msg))
            | Self::Table(TableError::Internal(msg))
            | Self::Internal(msg) => DbError::Internal(msg.clone()),
            Self::Corruption(msg) => DbError::Corruption(msg.clone()),
            Self::Closing => DbError::Closed,
        }
    }

    /// Owned copy, for errors held by a cursor and reported again.
    pub(crate) fn duplicate(&self) -> EngineError {
        match self.to_db_error() {
            DbError::Io(e) => EngineError::Io(e),
            DbError::Corruption(msg) => EngineError::Corruption(msg),
            DbError::Closed => EngineError::Closing,
            other => EngineError::Internal(other.to_string()),
        }
    }
}

fn poisoned<T>(_: T) -> EngineError {
    EngineError::Internal("Mutex poisoned".into())
}

// ------------------------------------------------------------------------------------------------
// Version
// ------------------------------------------------------------------------------------------------

/// An immutable view of every live layer.
pub(crate) struct Version {
    pub(crate) active: Arc<MemTable>,
    /// Newest first.
    pub(crate) frozen: Vec<Arc<MemTable>>,
    /// Newest first.
    pub(crate) tables: Vec<Arc<TableHandle>>,
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Version")
            .field("active", &self.active.id())
            .field("frozen", &self.frozen.iter().map(|m| m.id()).collect::<Vec<_>>())
            .field("tables", &self.tables.iter().map(|t| t.id()).collect::<Vec<_>>())
            .finish()
    }
}

impl Version {
    fn with_tables(&self, tables: Vec<Arc<TableHandle>>) -> Self {
        Self {
            active: Arc::clone(&self.active),
            frozen: self.frozen.clone(),
            tables,
        }
    }
}

/// Snapshot of engine state returned by [`Engine::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub last_sequence: SequenceNumber,
    pub active_memtable_bytes: usize,
    /// Memtables waiting to be flushed.
    pub frozen_count: usize,
    pub table_count: usize,
    pub total_table_bytes: u64,
    /// Newest first.
    pub table_sizes: Vec<u64>,
    /// Bytes of decoded blocks held by the block cache.
    pub block_cache_usage: usize,
}

/// Result of a point lookup.
#[derive(Debug, Default)]
pub struct Lookup {
    pub value: Option<Vec<u8>>,
    /// A table ran out of allowed seeks; a compaction should be scheduled.
    pub seek_compaction: bool,
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

struct EngineInner {
    dir: PathBuf,
    options: DbOptions,
    stats: Arc<Statistics>,
    table_ctx: TableReadContext,

    version: RwLock<Arc<Version>>,
    manifest: Mutex<Manifest>,

    /// Serializes writers, sequence assignment and freezes.
    writer: Mutex<()>,
    /// Signalled whenever a flush frees a memtable slot.
    stall_cv: Condvar,
    last_sequence: AtomicU64,

    flush_lock: Mutex<()>,
    running_compactions: AtomicUsize,
    seek_candidate: Mutex<Option<u64>>,

    bg_error: Mutex<Option<String>>,
    shutting_down: AtomicBool,
}

impl EngineInner {
    fn current(&self) -> Result<Arc<Version>, EngineError> {
        self.version
            .read()
            .map(|v| Arc::clone(&v))
            .map_err(|_| EngineError::Internal("RwLock poisoned".into()))
    }

    fn version_write(&self) -> Result<RwLockWriteGuard<'_, Arc<Version>>, EngineError> {
        self.version.write().map_err(|_| {
            error!("version lock poisoned");
            EngineError::Internal("RwLock poisoned".into())
        })
    }

    fn lock_manifest(&self) -> Result<MutexGuard<'_, Manifest>, EngineError> {
        self.manifest.lock().map_err(poisoned)
    }

    fn wal_dir(&self) -> PathBuf {
        self.dir.join(WAL_DIR)
    }

    fn table_path(&self, id: u64) -> PathBuf {
        self.dir.join(TABLE_DIR).join(table::table_file_name(id))
    }

    fn build_options(&self) -> TableBuildOptions {
        TableBuildOptions {
            format: self.options.table_format,
            block_size: self.options.block_size,
            compression: self.options.compression,
            filter_policy: self.options.filter_policy,
            prefix_len: self.options.fixed_prefix_len,
        }
    }

    fn open_memtable(&self, id: u64) -> Result<(MemTable, ReplayStats), EngineError> {
        Ok(MemTable::open(
            &self.wal_dir(),
            id,
            &self.options.memtable,
            self.options.fixed_prefix_len,
            self.options.paranoid_checks,
        )?)
    }
}

/// Slot in the bounded set of running compactions.
struct CompactionSlot<'a>(&'a AtomicUsize);

impl<'a> CompactionSlot<'a> {
    fn acquire(counter: &'a AtomicUsize, limit: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .ok()
            .map(|_| Self(counter))
    }
}

impl Drop for CompactionSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Handle to the storage engine. Cheap to clone; clones share state.
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dir", &self.inner.dir)
            .finish_non_exhaustive()
    }
}

impl Engine {
    // --------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------

    /// Open (or create) the engine rooted at `dir` and recover its state.
    ///
    /// Recovery loads the manifest, opens every table it lists, replays the
    /// frozen and active WAL segments into memtables and deletes files the
    /// manifest does not know about.
    pub fn open(
        dir: impl AsRef<Path>,
        options: DbOptions,
        stats: Arc<Statistics>,
    ) -> Result<Self, EngineError> {
        let dir = dir.as_ref().to_path_buf();
        let wal_dir = dir.join(WAL_DIR);
        let table_dir = dir.join(TABLE_DIR);
        for d in [&dir, &wal_dir, &table_dir] {
            fs::create_dir_all(d)?;
        }

        let mut manifest = Manifest::open(dir.join(MANIFEST_DIR))?;
        let mut data = manifest.data()?;

        let cache = (options.block_cache_capacity > 0)
            .then(|| Arc::new(BlockCache::new(options.block_cache_capacity)));
        let table_ctx = TableReadContext {
            cache,
            stats: Arc::clone(&stats),
        };

        let mut last_sequence = data.last_sequence;

        let mut tables = Vec::with_capacity(data.tables.len());
        for meta in &data.tables {
            let path = table_dir.join(table::table_file_name(meta.id));
            if !path.exists() {
                return Err(EngineError::Corruption(format!(
                    "table {} listed in manifest is missing",
                    meta.id
                )));
            }
            let handle = TableHandle::open(meta.id, &path, &table_ctx)?;
            if handle.file_size() != meta.file_size {
                return Err(EngineError::Corruption(format!(
                    "table {} has size {}, manifest says {}",
                    meta.id,
                    handle.file_size(),
                    meta.file_size
                )));
            }
            last_sequence = last_sequence.max(handle.properties().max_seq);
            tables.push(Arc::new(handle));
        }
        let live_tables: HashSet<u64> = data.tables.iter().map(|t| t.id).collect();
        remove_orphans(&table_dir, |path| {
            match path.extension().and_then(|e| e.to_str()) {
                Some("tmp") => true,
                Some("sst") => path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u64>().ok())
                    .is_some_and(|id| !live_tables.contains(&id)),
                _ => false,
            }
        })?;

        if data.active_wal == 0 {
            let id = manifest.allocate_file_number()?;
            manifest.set_active_wal(id)?;
            data.active_wal = id;
        }

        let open_memtable = |id: u64| {
            MemTable::open(
                &wal_dir,
                id,
                &options.memtable,
                options.fixed_prefix_len,
                options.paranoid_checks,
            )
        };

        let mut frozen = Vec::with_capacity(data.frozen_wals.len());
        for &id in &data.frozen_wals {
            let (memtable, replay) = open_memtable(id)?;
            last_sequence = last_sequence.max(replay.max_seq);
            frozen.push(Arc::new(memtable));
        }
        frozen.reverse();

        let (active, replay) = open_memtable(data.active_wal)?;
        last_sequence = last_sequence.max(replay.max_seq);

        let live_wals: HashSet<u64> = data
            .frozen_wals
            .iter()
            .copied()
            .chain(std::iter::once(data.active_wal))
            .collect();
        remove_orphans(&wal_dir, |path| {
            wal::parse_segment_id(path).is_some_and(|id| !live_wals.contains(&id))
        })?;

        manifest.set_last_sequence(last_sequence)?;
        manifest.checkpoint()?;

        info!(
            dir = %dir.display(),
            tables = tables.len(),
            frozen = frozen.len(),
            active_wal = data.active_wal,
            active_records = replay.records,
            last_sequence,
            "engine opened"
        );

        let version = Version {
            active: Arc::new(active),
            frozen,
            tables,
        };

        Ok(Self {
            inner: Arc::new(EngineInner {
                dir,
                options,
                stats,
                table_ctx,
                version: RwLock::new(Arc::new(version)),
                manifest: Mutex::new(manifest),
                writer: Mutex::new(()),
                stall_cv: Condvar::new(),
                last_sequence: AtomicU64::new(last_sequence),
                flush_lock: Mutex::new(()),
                running_compactions: AtomicUsize::new(0),
                seek_candidate: Mutex::new(None),
                bg_error: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    /// Wake stalled writers and make them fail with [`EngineError::Closing`].
    pub fn begin_shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        self.inner.stall_cv.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Flush everything that would otherwise need the WAL, checkpoint the
    /// manifest and sync directories. Background work must be stopped first.
    pub fn close(&self) -> Result<(), EngineError> {
        self.begin_shutdown();

        while self.flush_oldest_frozen()? {}

        let active = Arc::clone(&self.inner.current()?.active);
        if active.has_unlogged_writes() {
            {
                let _writer = self.inner.writer.lock().map_err(poisoned)?;
                self.freeze_active()?;
            }
            while self.flush_oldest_frozen()? {}
        } else {
            active.sync_wal()?;
        }

        {
            let mut manifest = self.inner.lock_manifest()?;
            manifest.set_last_sequence(self.inner.last_sequence.load(Ordering::Acquire))?;
            manifest.checkpoint()?;
        }

        let dir = &self.inner.dir;
        for d in [dir.join(WAL_DIR), dir.join(TABLE_DIR), dir.join(MANIFEST_DIR), dir.clone()] {
            File::open(&d)?.sync_all()?;
        }

        info!(dir = %dir.display(), "engine closed");
        Ok(())
    }

    // --------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------

    /// Insert or overwrite `key`. Returns `true` when the write froze the
    /// active memtable, i.e. a flush is due.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, opts: &WriteOptions) -> Result<bool, EngineError> {
        self.write(Record::put(key, value, 0), opts)
    }

    /// Write a tombstone for `key`. Same return value as [`put`](Self::put).
    pub fn delete(&self, key: Vec<u8>, opts: &WriteOptions) -> Result<bool, EngineError> {
        self.write(Record::tombstone(key, 0), opts)
    }

    fn write(&self, mut record: Record, opts: &WriteOptions) -> Result<bool, EngineError> {
        let inner = &*self.inner;
        let start = Instant::now();

        let mut writer = inner.writer.lock().map_err(poisoned)?;
        if self.is_shutting_down() {
            return Err(EngineError::Closing);
        }

        let mut froze = false;
        if inner.current()?.active.approximate_size() >= inner.options.write_buffer_size {
            writer = self.wait_for_room(writer)?;
            self.freeze_active()?;
            froze = true;
        }

        let seq = inner.last_sequence.load(Ordering::Acquire) + 1;
        record.seq = seq;
        let tombstone = record.is_tombstone();
        let bytes = (record.key.len() + record.value.as_ref().map_or(0, Vec::len)) as u64;

        let active = Arc::clone(&inner.current()?.active);
        let wal_bytes = active.apply(record, opts)?;
        inner.last_sequence.store(seq, Ordering::Release);
        drop(writer);

        let stats = &inner.stats;
        if tombstone {
            stats.record_tick(Ticker::NumberKeysDeleted, 1);
        } else {
            stats.record_tick(Ticker::NumberKeysWritten, 1);
        }
        stats.record_tick(Ticker::BytesWritten, bytes);
        stats.measure(HistogramType::BytesPerWrite, bytes);
        if wal_bytes > 0 {
            stats.record_tick(Ticker::WalFileBytes, wal_bytes as u64);
            if opts.sync {
                stats.record_tick(Ticker::WalFileSynced, 1);
            }
        }
        stats.measure_since(HistogramType::DbWrite, start);

        Ok(froze)
    }

    /// Block until a memtable slot is free. Called with the writer lock held.
    fn wait_for_room<'a>(&self, mut writer: MutexGuard<'a, ()>) -> Result<MutexGuard<'a, ()>, EngineError> {
        let inner = &*self.inner;
        let mut stalled_since: Option<Instant> = None;
        loop {
            if self.is_shutting_down() {
                return Err(EngineError::Closing);
            }
            let live = inner.current()?.frozen.len() + 1;
            if live < inner.options.max_write_buffer_number {
                break;
            }
            if stalled_since.is_none() {
                debug!(live, "write stalled, too many memtables");
                stalled_since = Some(Instant::now());
            }
            writer = inner
                .stall_cv
                .wait_timeout(writer, STALL_POLL)
                .map_err(poisoned)?
                .0;
        }
        if let Some(since) = stalled_since {
            let micros = since.elapsed().as_micros() as u64;
            inner.stats.record_tick(Ticker::StallMicros, micros);
            inner.stats.measure(HistogramType::WriteStall, micros);
        }
        Ok(writer)
    }

    /// Swap in a fresh memtable on a new WAL segment. Caller holds `writer`.
    fn freeze_active(&self) -> Result<(), EngineError> {
        let inner = &*self.inner;
        let manifest = inner.lock_manifest()?;
        let id = manifest.allocate_file_number()?;
        let (memtable, _) = inner.open_memtable(id)?;
        manifest.rotate_wal(id)?;

        let mut version = inner.version_write()?;
        let old = Arc::clone(&version);
        let mut frozen = Vec::with_capacity(old.frozen.len() + 1);
        frozen.push(Arc::clone(&old.active));
        frozen.extend(old.frozen.iter().cloned());
        *version = Arc::new(Version {
            active: Arc::new(memtable),
            frozen,
            tables: old.tables.clone(),
        });

        info!(
            frozen_wal = old.active.id(),
            frozen_bytes = old.active.approximate_size(),
            active_wal = id,
            frozen_count = old.frozen.len() + 1,
            "memtable frozen"
        );
        Ok(())
    }

    // --------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------

    /// Latest value of `key`, `None` when absent or deleted.
    pub fn get(&self, key: &[u8], opts: &ReadOptions) -> Result<Lookup, EngineError> {
        let inner = &*self.inner;
        let stats = &inner.stats;
        let start = Instant::now();
        let version = inner.current()?;

        let mut found = version.active.get(key)?;
        if found.is_none() {
            for memtable in &version.frozen {
                found = memtable.get(key)?;
                if found.is_some() {
                    break;
                }
            }
        }

        let mut lookup = Lookup::default();
        if found.is_some() {
            stats.record_tick(Ticker::MemtableHit, 1);
        } else {
            stats.record_tick(Ticker::MemtableMiss, 1);

            // First table whose data was read in vain, and whether an older
            // table had to be consulted after it.
            let mut wasted: Option<&Arc<TableHandle>> = None;
            let mut went_past = false;
            for table in &version.tables {
                if wasted.is_some() {
                    went_past = true;
                }
                match table.get(key, opts.fill_cache)? {
                    TableLookup::Filtered => {}
                    TableLookup::Absent => {
                        if wasted.is_none() {
                            wasted = Some(table);
                        }
                    }
                    TableLookup::Found(record) => {
                        stats.record_tick(Ticker::TableGetHit, 1);
                        found = Some(record);
                        break;
                    }
                }
            }

            if let (Some(table), true) = (wasted, went_past) {
                if !inner.options.disable_seek_compaction && table.charge_seek() {
                    debug!(table_id = table.id(), "table exhausted its allowed seeks");
                    *inner.seek_candidate.lock().map_err(poisoned)? = Some(table.id());
                    lookup.seek_compaction = true;
                }
            }
        }

        lookup.value = found.and_then(|r| r.value);
        stats.record_tick(Ticker::NumberKeysRead, 1);
        if let Some(value) = &lookup.value {
            stats.record_tick(Ticker::BytesRead, value.len() as u64);
            stats.measure(HistogramType::BytesPerRead, value.len() as u64);
        }
        stats.measure_since(HistogramType::DbGet, start);

        trace!(key = %HexKey(key), found = lookup.value.is_some(), "engine get");
        Ok(lookup)
    }

    /// Iterator over a snapshot of the current state.
    pub fn iter(&self, opts: &ReadOptions) -> Result<DbIterator, EngineError> {
        let inner = &*self.inner;
        // Sequence before version: anything in the version newer than the
        // sequence is hidden by the iterator.
        let sequence = inner.last_sequence.load(Ordering::Acquire);
        let version = inner.current()?;

        let mut children: Vec<Box<dyn RecordCursor>> =
            Vec::with_capacity(1 + version.frozen.len() + version.tables.len());
        children.push(Box::new(version.active.cursor()));
        for memtable in &version.frozen {
            children.push(Box::new(memtable.cursor()));
        }
        for table in &version.tables {
            children.push(table.cursor(opts.fill_cache));
        }

        Ok(DbIterator::new(
            MergingCursor::new(children),
            sequence,
            version,
            Arc::clone(&inner.stats),
        ))
    }

    // --------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------

    pub fn frozen_count(&self) -> Result<usize, EngineError> {
        Ok(self.inner.current()?.frozen.len())
    }

    /// Flush the oldest frozen memtable to a table. Returns `false` when
    /// there was nothing to flush.
    pub fn flush_oldest_frozen(&self) -> Result<bool, EngineError> {
        let inner = &*self.inner;
        let _flush = inner.flush_lock.lock().map_err(poisoned)?;

        let Some(memtable) = inner.current()?.frozen.last().cloned() else {
            return Ok(false);
        };
        let start = Instant::now();

        let records = memtable.sorted_records()?;
        let output = if records.is_empty() {
            None
        } else {
            let id = inner.lock_manifest()?.allocate_file_number()?;
            let path = inner.table_path(id);
            let built = table::build_table(&path, &inner.build_options(), records)?;
            debug!(
                table_id = id,
                entries = built.properties.num_entries,
                deletions = built.properties.num_deletions,
                "flush output written"
            );
            Some(Arc::new(TableHandle::open(id, &built.path, &inner.table_ctx)?))
        };

        {
            let manifest = inner.lock_manifest()?;
            let meta = output.as_ref().map(|t| TableMeta {
                id: t.id(),
                file_size: t.file_size(),
            });
            manifest.record_flush(memtable.id(), meta, memtable.max_seq())?;

            let mut version = inner.version_write()?;
            let old = Arc::clone(&version);
            let frozen = old
                .frozen
                .iter()
                .filter(|m| m.id() != memtable.id())
                .cloned()
                .collect();
            let mut tables = Vec::with_capacity(old.tables.len() + 1);
            tables.extend(output.iter().cloned());
            tables.extend(old.tables.iter().cloned());
            *version = Arc::new(Version {
                active: Arc::clone(&old.active),
                frozen,
                tables,
            });
        }
        inner.stall_cv.notify_all();
        self.maybe_checkpoint()?;

        let wal_path = memtable.wal_path();
        if let Err(e) = fs::remove_file(&wal_path) {
            warn!(path = %wal_path.display(), %e, "failed to remove flushed WAL segment");
        }

        let written = output.as_ref().map_or(0, |t| t.file_size());
        inner.stats.record_tick(Ticker::FlushCount, 1);
        inner.stats.record_tick(Ticker::FlushWriteBytes, written);
        inner.stats.measure_since(HistogramType::FlushTime, start);

        info!(
            wal_id = memtable.id(),
            table_id = output.as_ref().map(|t| t.id()),
            records = memtable.len(),
            bytes = written,
            "memtable flushed"
        );
        Ok(true)
    }

    /// Freeze the active memtable (if non-empty) and flush every frozen one.
    /// Returns the number of memtables flushed.
    pub fn flush_all(&self) -> Result<usize, EngineError> {
        {
            let _writer = self.inner.writer.lock().map_err(poisoned)?;
            if !self.inner.current()?.active.is_empty() {
                self.freeze_active()?;
            }
        }
        let mut flushed = 0;
        while self.flush_oldest_frozen()? {
            flushed += 1;
        }
        Ok(flushed)
    }

    fn maybe_checkpoint(&self) -> Result<(), EngineError> {
        let mut manifest = self.inner.lock_manifest()?;
        if manifest.pending_events() >= CHECKPOINT_INTERVAL {
            manifest.checkpoint()?;
        }
        Ok(())
    }

    // --------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------

    /// Run one background compaction if one is due and a slot is free.
    pub fn compact_once(&self) -> Result<bool, EngineError> {
        let inner = &*self.inner;
        let Some(_slot) = CompactionSlot::acquire(
            &inner.running_compactions,
            inner.options.max_background_compactions,
        ) else {
            return Ok(false);
        };

        let seek_candidate = if inner.options.disable_seek_compaction {
            None
        } else {
            inner.seek_candidate.lock().map_err(poisoned)?.take()
        };

        let version = inner.current()?;
        let Some(pick) = compaction::pick(&version.tables, &inner.options, seek_candidate) else {
            return Ok(false);
        };
        drop(version);

        self.run_compaction(pick)?;
        Ok(true)
    }

    /// Merge every table into one. Waits for running compactions to let go
    /// of their inputs. Returns `false` with fewer than two tables.
    pub fn compact_all(&self) -> Result<bool, EngineError> {
        loop {
            if self.is_shutting_down() {
                return Err(EngineError::Closing);
            }
            let version = self.inner.current()?;
            if version.tables.len() < 2 {
                return Ok(false);
            }
            if let Some(pick) = compaction::pick_all(&version.tables) {
                drop(version);
                self.run_compaction(pick)?;
                return Ok(true);
            }
            drop(version);
            thread::sleep(STALL_POLL);
        }
    }

    fn run_compaction(&self, pick: CompactionPick) -> Result<(), EngineError> {
        let inner = &*self.inner;
        let start = Instant::now();
        let input_ids: Vec<u64> = pick.inputs().iter().map(|t| t.id()).collect();

        debug!(
            inputs = ?input_ids,
            reason = pick.reason().as_str(),
            includes_oldest = pick.includes_oldest(),
            "compaction started"
        );

        let id = inner.lock_manifest()?.allocate_file_number()?;
        let path = inner.table_path(id);
        let outcome = compaction::merge(&pick, &path, &inner.build_options())?;

        if let Some(built) = &outcome.built {
            debug!(
                table_id = id,
                entries = built.properties.num_entries,
                bytes = built.file_size,
                "compaction output written"
            );
        }
        let output = match &outcome.built {
            Some(built) => match TableHandle::open(id, &built.path, &inner.table_ctx) {
                Ok(handle) => Some(Arc::new(handle)),
                Err(e) => {
                    if let Err(rm) = fs::remove_file(&path) {
                        warn!(path = %path.display(), %rm, "failed to remove compaction output");
                    }
                    return Err(e.into());
                }
            },
            None => None,
        };

        {
            let manifest = inner.lock_manifest()?;
            let meta = output.as_ref().map(|t| TableMeta {
                id: t.id(),
                file_size: t.file_size(),
            });
            manifest.apply_compaction(meta, input_ids.clone())?;

            let mut version = inner.version_write()?;
            let old = Arc::clone(&version);
            let position = old
                .tables
                .iter()
                .position(|t| input_ids.contains(&t.id()))
                .unwrap_or(old.tables.len());
            let mut tables: Vec<Arc<TableHandle>> = old
                .tables
                .iter()
                .filter(|t| !input_ids.contains(&t.id()))
                .cloned()
                .collect();
            if let Some(out) = &output {
                tables.insert(position.min(tables.len()), Arc::clone(out));
            }
            *version = Arc::new(old.with_tables(tables));
        }

        for table in pick.inputs() {
            table.mark_obsolete();
        }
        self.maybe_checkpoint()?;

        let stats = &inner.stats;
        let read_bytes = pick.input_bytes();
        let written = output.as_ref().map_or(0, |t| t.file_size());
        stats.record_tick(Ticker::CompactionCount, 1);
        stats.record_tick(Ticker::CompactReadBytes, read_bytes);
        stats.record_tick(Ticker::CompactWriteBytes, written);
        stats.record_tick(Ticker::CompactionKeyDropNewerEntry, outcome.dropped_superseded);
        stats.record_tick(Ticker::CompactionKeyDropObsolete, outcome.dropped_tombstones);
        if pick.reason() == CompactionReason::Seek {
            stats.record_tick(Ticker::SeekCompactions, 1);
        }
        stats.measure(HistogramType::NumFilesInSingleCompaction, input_ids.len() as u64);
        stats.measure_since(HistogramType::CompactionTime, start);

        info!(
            inputs = input_ids.len(),
            reason = pick.reason().as_str(),
            output = output.as_ref().map(|t| t.id()),
            read_bytes,
            written,
            "compaction completed"
        );
        Ok(())
    }

    // --------------------------------------------------------------------
    // Background errors and stats
    // --------------------------------------------------------------------

    /// Keep `err` as the last background error.
    pub fn record_background_error(&self, err: &EngineError) {
        self.inner.stats.record_tick(Ticker::BackgroundErrors, 1);
        error!(%err, "background job failed");
        if let Ok(mut slot) = self.inner.bg_error.lock() {
            *slot = Some(err.to_string());
        }
    }

    pub fn background_error(&self) -> Option<String> {
        self.inner.bg_error.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.inner.stats
    }

    pub fn options(&self) -> &DbOptions {
        &self.inner.options
    }

    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let version = self.inner.current()?;
        let table_sizes: Vec<u64> = version.tables.iter().map(|t| t.file_size()).collect();
        Ok(EngineStats {
            last_sequence: self.inner.last_sequence.load(Ordering::Acquire),
            active_memtable_bytes: version.active.approximate_size(),
            frozen_count: version.frozen.len(),
            table_count: table_sizes.len(),
            total_table_bytes: table_sizes.iter().sum(),
            table_sizes,
            block_cache_usage: self.inner.table_ctx.cache.as_ref().map_or(0, |c| c.usage()),
        })
    }

    #[cfg(test)]
    pub(crate) fn current_version(&self) -> Result<Arc<Version>, EngineError> {
        self.inner.current()
    }
}

/// Delete every file in `dir` for which `is_orphan` holds.
fn remove_orphans(dir: &Path, is_orphan: impl Fn(&Path) -> bool) -> Result<(), EngineError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || !is_orphan(&path) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => info!(path = %path.display(), "removed orphan file"),
            Err(e) => warn!(path = %path.display(), %e, "failed to remove orphan file"),
        }
    }
    Ok(())
}
