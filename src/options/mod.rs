//! Database, write and read options.
//!
//! [`DbOptions`] is read once by [`Db::open`](crate::Db::open); changing it
//! requires reopening. [`WriteOptions`] and [`ReadOptions`] are per call.


use std::sync::Arc;

use crate::DbError;
use crate::filter::FilterPolicy;
use crate::statistics::Statistics;

// ------------------------------------------------------------------------------------------------
// Memtable selection
// ------------------------------------------------------------------------------------------------

/// Which in-memory write buffer representation to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemTableConfig {
    /// Ordered skip list. The default.
    #[default]
    SkipList,

    /// Keys hashed by prefix into buckets, each an independent skip list.
    HashSkipList {
        bucket_count: usize,
        height: usize,
        branching_factor: usize,
    },

    /// Keys hashed by prefix into buckets, each an unordered list.
    HashLinkedList { bucket_count: usize },

    /// Append-only vector, sorted lazily on first read.
    Vector { reserved_size: usize },
}

impl MemTableConfig {
    pub const DEFAULT_SKIPLIST_HEIGHT: usize = 12;
    pub const DEFAULT_BRANCHING_FACTOR: usize = 4;

    pub fn hash_skip_list() -> Self {
        Self::HashSkipList {
            bucket_count: 1_000_000,
            height: 4,
            branching_factor: 4,
        }
    }

    pub fn hash_linked_list() -> Self {
        Self::HashLinkedList {
            bucket_count: 50_000,
        }
    }

    pub fn vector() -> Self {
        Self::Vector { reserved_size: 0 }
    }

    /// Name of the factory this configuration selects.
    pub fn factory_name(&self) -> &'static str {
        match self {
            Self::SkipList => "SkipListFactory",
            Self::HashSkipList { .. } => "HashSkipListRepFactory",
            Self::HashLinkedList { .. } => "HashLinkedListRepFactory",
            Self::Vector { .. } => "VectorRepFactory",
        }
    }

    fn validate(&self) -> Result<(), DbError> {
        match *self {
            Self::SkipList | Self::Vector { .. } => Ok(()),
            Self::HashSkipList {
                bucket_count,
                height,
                branching_factor,
            } => {
                if bucket_count == 0 {
                    return Err(DbError::InvalidConfig("bucket_count must be > 0".into()));
                }
                if !(1..=32).contains(&height) {
                    return Err(DbError::InvalidConfig(
                        "skip list height must be in 1..=32".into(),
                    ));
                }
                if branching_factor < 2 {
                    return Err(DbError::InvalidConfig(
                        "branching_factor must be >= 2".into(),
                    ));
                }
                Ok(())
            }
            Self::HashLinkedList { bucket_count } => {
                if bucket_count == 0 {
                    return Err(DbError::InvalidConfig("bucket_count must be > 0".into()));
                }
                Ok(())
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Table selection
// ------------------------------------------------------------------------------------------------

/// On-disk table format used for newly written tables.
///
/// Tables already on disk keep the format they were written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableFormat {
    /// Fixed-size, checksummed, cacheable blocks behind a sparse index.
    #[default]
    BlockBased,
    /// One contiguous memory-mapped run with a per-record offset index.
    Plain,
}

impl TableFormat {
    pub fn factory_name(&self) -> &'static str {
        match self {
            Self::BlockBased => "BlockBasedTable",
            Self::Plain => "PlainTable",
        }
    }
}

/// Block compression for block-based tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    #[default]
    None,
    Snappy,
}

// ------------------------------------------------------------------------------------------------
// DbOptions
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Db`](crate::Db).
///
/// ```rust
/// use sedimentdb::{DbOptions, FilterPolicy, MemTableConfig};
///
/// let options = DbOptions {
///     create_if_missing: true,
///     write_buffer_size: 8 * 1024,
///     max_write_buffer_number: 3,
///     memtable: MemTableConfig::hash_skip_list(),
///     filter_policy: Some(FilterPolicy::bloom(10)),
///     ..DbOptions::default()
/// };
/// assert_eq!(options.memtable_factory_name(), "HashSkipListRepFactory");
/// ```
#[derive(Debug, Clone)]
pub struct DbOptions {
    /// Create the database when the directory holds none. Default: false.
    pub create_if_missing: bool,

    /// Fail `open` when a database already exists. Default: false.
    pub error_if_exists: bool,

    /// Memtable byte size at which it is frozen and queued for flush.
    /// Default: 4 MiB. Must be > 0.
    pub write_buffer_size: usize,

    /// Cap on live memtables (active + queued for flush). Writers stall
    /// once it is reached. Default: 2. Must be >= 2.
    pub max_write_buffer_number: usize,

    /// Target uncompressed data block size for block-based tables.
    /// Default: 4 KiB. Must be >= 256.
    pub block_size: usize,

    /// Concurrent compaction jobs. Default: 1. Must be >= 1.
    pub max_background_compactions: usize,

    /// Concurrent flush jobs. Default: 1. Must be >= 1.
    pub max_background_flushes: usize,

    /// Table count at which every run of idle tables is merged even when
    /// no size-ratio window qualifies. Default: 4. Must be >= 2.
    pub level0_file_num_compaction_trigger: usize,

    /// Percentage slack allowed when growing a size-ratio compaction window.
    /// Default: 1.
    pub compaction_size_ratio: u32,

    /// Turn off read-triggered compaction. Default: false.
    pub disable_seek_compaction: bool,

    pub memtable: MemTableConfig,

    pub table_format: TableFormat,

    /// Block compression (block-based tables only). Default: none.
    pub compression: CompressionType,

    /// Per-table filter. Default: Bloom with 10 bits per key.
    pub filter_policy: Option<FilterPolicy>,

    /// Shared block cache size in bytes; 0 disables caching. Default: 8 MiB.
    pub block_cache_capacity: usize,

    /// Leading key bytes used as the hash key of hash memtables and the
    /// prefix index of plain tables. `None` hashes the whole key.
    pub fixed_prefix_len: Option<usize>,

    /// Treat checksum failures in WAL segments as corruption rather than a
    /// torn tail. Default: true.
    pub paranoid_checks: bool,

    /// Statistics sink. When `None` the database creates its own,
    /// reachable through [`Db::statistics`](crate::Db::statistics).
    pub statistics: Option<Arc<Statistics>>,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            create_if_missing: false,
            error_if_exists: false,
            write_buffer_size: 4 * 1024 * 1024,
            max_write_buffer_number: 2,
            block_size: 4 * 1024,
            max_background_compactions: 1,
            max_background_flushes: 1,
            level0_file_num_compaction_trigger: 4,
            compaction_size_ratio: 1,
            disable_seek_compaction: false,
            memtable: MemTableConfig::SkipList,
            table_format: TableFormat::BlockBased,
            compression: CompressionType::None,
            filter_policy: Some(FilterPolicy::bloom(10)),
            block_cache_capacity: 8 * 1024 * 1024,
            fixed_prefix_len: None,
            paranoid_checks: true,
            statistics: None,
        }
    }
}

impl DbOptions {
    /// Enable statistics collection with a fresh [`Statistics`] handle.
    pub fn create_statistics(&mut self) -> Arc<Statistics> {
        let stats = Arc::new(Statistics::new());
        self.statistics = Some(Arc::clone(&stats));
        stats
    }

    pub fn memtable_factory_name(&self) -> &'static str {
        self.memtable.factory_name()
    }

    pub fn table_factory_name(&self) -> &'static str {
        self.table_format.factory_name()
    }

    /// Check every parameter, returning the first violation.
    pub fn validate(&self) -> Result<(), DbError> {
        if self.write_buffer_size == 0 {
            return Err(DbError::InvalidConfig(
                "write_buffer_size must be > 0".into(),
            ));
        }
        if self.max_write_buffer_number < 2 {
            return Err(DbError::InvalidConfig(
                "max_write_buffer_number must be >= 2".into(),
            ));
        }
        if self.block_size < 256 {
            return Err(DbError::InvalidConfig("block_size must be >= 256".into()));
        }
        if self.max_background_compactions < 1 {
            return Err(DbError::InvalidConfig(
                "max_background_compactions must be >= 1".into(),
            ));
        }
        if self.max_background_flushes < 1 {
            return Err(DbError::InvalidConfig(
                "max_background_flushes must be >= 1".into(),
            ));
        }
        if self.level0_file_num_compaction_trigger < 2 {
            return Err(DbError::InvalidConfig(
                "level0_file_num_compaction_trigger must be >= 2".into(),
            ));
        }
        if self.fixed_prefix_len == Some(0) {
            return Err(DbError::InvalidConfig(
                "fixed_prefix_len must be > 0 when set".into(),
            ));
        }
        if let Some(policy) = &self.filter_policy {
            policy.validate()?;
        }
        self.memtable.validate()
    }
}

// ------------------------------------------------------------------------------------------------
// Per-call options
// ------------------------------------------------------------------------------------------------

/// Options for a single write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Fsync the WAL before acknowledging the write.
    pub sync: bool,
    /// Skip the WAL entirely; the write is lost on crash until flushed.
    pub disable_wal: bool,
}

/// Options for a single read or iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Keep blocks read from disk in the shared block cache. Default: true.
    pub fill_cache: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self { fill_cache: true }
    }
}
