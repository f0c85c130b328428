//! # SedimentDB
//!
//! An embeddable, ordered key-value store built on a **Log-Structured
//! Merge Tree**. Writes land in a write-ahead log and an in-memory
//! memtable; full memtables are flushed to immutable, checksummed tables
//! that background compaction merges over time.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sedimentdb::{Db, DbOptions, GetInto};
//!
//! let options = DbOptions {
//!     create_if_missing: true,
//!     ..DbOptions::default()
//! };
//! let db = Db::open("/tmp/my_db", options)?;
//!
//! db.put(b"hello", b"world")?;
//! assert_eq!(db.get(b"hello")?, Some(b"world".to_vec()));
//!
//! // Read into a caller buffer.
//! let mut buf = [0u8; 3];
//! assert_eq!(db.get_into(b"hello", &mut buf)?, GetInto::Found { len: 5, written: 3 });
//!
//! db.delete(b"hello")?;
//! assert_eq!(db.get(b"hello")?, None);
//!
//! // Ordered iteration over a snapshot.
//! db.put(b"a", b"1")?;
//! db.put(b"b", b"2")?;
//! let mut it = db.iter()?;
//! it.seek_to_first();
//! while it.valid() {
//!     println!("{:?} => {:?}", it.key(), it.value());
//!     it.next();
//! }
//! it.status()?;
//!
//! db.close()?;
//! # Ok::<(), sedimentdb::DbError>(())
//! ```
//!
//! ## Features
//!
//! - **Pluggable memtables**: skip list, hash skip list, hash linked list, vector.
//! - **Two table formats**: block-based (cached, optionally Snappy-compressed) and plain.
//! - **Bloom filters** skip tables that cannot hold a key.
//! - **Crash recovery** from per-memtable WAL segments and a checksummed manifest.
//! - **Background flush and compaction** on a bounded worker pool.
//! - **Statistics**: tickers and histograms for every layer.

pub(crate) mod cache;
pub(crate) mod compaction;
pub(crate) mod encoding;
pub(crate) mod engine;
pub(crate) mod filter;
pub(crate) mod iterator;
pub(crate) mod manifest;
pub(crate) mod memtable;
pub(crate) mod options;
pub(crate) mod record;
pub(crate) mod statistics;
pub(crate) mod table;
pub(crate) mod wal;

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use engine::{Engine, EngineError};
use manifest::Manifest;

pub use engine::EngineStats;
pub use filter::FilterPolicy;
pub use iterator::DbIterator;
pub use options::{CompressionType, DbOptions, MemTableConfig, ReadOptions, TableFormat, WriteOptions};
pub use statistics::{HistogramData, HistogramType, Statistics, Ticker};

/// First delay before a failed background flush is retried.
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Db`] operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database has been closed.
    #[error("database is closed")]
    Closed,

    /// The database does not exist (and `create_if_missing` is off).
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Key or value constraint violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(io::Error),

    /// Checksum, magic or manifest mismatch.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Poisoned lock or broken invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<EngineError> for DbError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Io(io) => DbError::Io(io),
            other => other.to_db_error(),
        }
    }
}

/// Outcome of [`Db::get_into`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetInto {
    NotFound,
    /// `len` is the full value length; `written = min(len, buf.len())`
    /// bytes were copied.
    Found { len: usize, written: usize },
}

// ------------------------------------------------------------------------------------------------
// Background worker state
// ------------------------------------------------------------------------------------------------

type Job = Box<dyn FnOnce() + Send>;

/// Holds the job sender and worker handles.
/// Taken (`Option::take`) on shutdown to ensure single cleanup.
struct BackgroundPool {
    sender: crossbeam::channel::Sender<Job>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl BackgroundPool {
    fn spawn(size: usize) -> Result<Self, DbError> {
        let (sender, receiver) = crossbeam::channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let rx = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("sedimentdb-bg-{id}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .map_err(DbError::Io)?;
            workers.push(handle);
        }
        Ok(Self { sender, workers })
    }
}

/// Flush the oldest frozen memtable, retrying with backoff until it
/// succeeds or the engine shuts down.
fn flush_with_retry(engine: &Engine) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match engine.flush_oldest_frozen() {
            Ok(flushed) => {
                if flushed {
                    debug!("background: flushed frozen memtable");
                }
                return;
            }
            Err(e) => {
                engine.record_background_error(&e);
                if engine.is_shutting_down() {
                    return;
                }
                thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

/// Run compactions until none is due.
fn compact_until_idle(engine: &Engine) {
    while !engine.is_shutting_down() {
        match engine.compact_once() {
            Ok(true) => debug!("background: compaction round"),
            Ok(false) => break,
            Err(e) => {
                engine.record_background_error(&e);
                break;
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Database handle
// ------------------------------------------------------------------------------------------------

/// The main database handle.
///
/// `Db` is `Send + Sync`; share it across threads via `Arc<Db>`.
///
/// # Background work
///
/// When a write fills the active memtable, it is frozen and a job is
/// queued that flushes it to a table and then runs compactions until none
/// is due. A read that exhausts a table's seek allowance queues a
/// compaction job too. Jobs run on `max_background_flushes +
/// max_background_compactions` worker threads.
///
/// # Shutdown
///
/// Call [`Db::close`] for a graceful shutdown. If the handle is dropped
/// without calling `close`, the destructor attempts the same cleanup and
/// ignores errors.
pub struct Db {
    engine: Engine,
    bg: Mutex<Option<BackgroundPool>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Open the database in `path`, recovering its last durable state.
    ///
    /// # Errors
    ///
    /// - [`DbError::InvalidConfig`] if `options` fail validation.
    /// - [`DbError::NotFound`] if no database exists and
    ///   `create_if_missing` is off.
    /// - [`DbError::InvalidArgument`] if one exists and `error_if_exists`
    ///   is on.
    /// - [`DbError::Corruption`] if the on-disk state is damaged.
    pub fn open(path: impl AsRef<Path>, options: DbOptions) -> Result<Self, DbError> {
        options.validate()?;
        let path = path.as_ref();

        let exists = Manifest::exists(path.join(engine::MANIFEST_DIR));
        if !exists && !options.create_if_missing {
            return Err(DbError::NotFound(format!(
                "no database at {}",
                path.display()
            )));
        }
        if exists && options.error_if_exists {
            return Err(DbError::InvalidArgument(format!(
                "database already exists at {}",
                path.display()
            )));
        }

        let stats = options
            .statistics
            .clone()
            .unwrap_or_else(|| Arc::new(Statistics::new()));
        let pool_size = options.max_background_flushes + options.max_background_compactions;
        let engine = Engine::open(path, options, stats)?;
        let pool = BackgroundPool::spawn(pool_size)?;

        info!(
            path = %path.display(),
            pool_size,
            memtable = engine.options().memtable_factory_name(),
            table = engine.options().table_factory_name(),
            "database opened"
        );

        let db = Self {
            engine,
            bg: Mutex::new(Some(pool)),
            closed: AtomicBool::new(false),
        };
        for _ in 0..db.engine.frozen_count()? {
            db.schedule_flush();
        }
        Ok(db)
    }

    /// Gracefully shut down the database.
    ///
    /// Stops background work, flushes every queued memtable (and the active
    /// one if it holds writes made without the WAL), checkpoints the
    /// manifest and fsyncs all directories.
    ///
    /// Subsequent operations on this handle return [`DbError::Closed`].
    /// Calling `close` more than once is harmless.
    pub fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.engine.begin_shutdown();
        self.shutdown_pool();
        self.engine.close()?;

        info!("database closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Insert or overwrite `key` with default [`WriteOptions`].
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.put_opt(&WriteOptions::default(), key, value)
    }

    /// Insert or overwrite `key`. Values may be empty.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::InvalidArgument`] if `key` is empty.
    pub fn put_opt(&self, opts: &WriteOptions, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        self.check_open()?;
        check_key(key)?;

        let written = self.engine.put(key.to_vec(), value.to_vec(), opts);
        self.flush_if_frozen(&written);
        written?;
        Ok(())
    }

    /// Delete `key` with default [`WriteOptions`].
    pub fn delete(&self, key: &[u8]) -> Result<(), DbError> {
        self.delete_opt(&WriteOptions::default(), key)
    }

    /// Delete `key` by writing a tombstone. Deleting an absent key is not
    /// an error.
    pub fn delete_opt(&self, opts: &WriteOptions, key: &[u8]) -> Result<(), DbError> {
        self.check_open()?;
        check_key(key)?;

        let written = self.engine.delete(key.to_vec(), opts);
        self.flush_if_frozen(&written);
        written?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Latest value of `key`, or `None` if absent or deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.get_opt(&ReadOptions::default(), key)
    }

    pub fn get_opt(&self, opts: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.check_open()?;
        check_key(key)?;

        let lookup = self.engine.get(key, opts)?;
        if lookup.seek_compaction {
            self.schedule_compaction();
        }
        Ok(lookup.value)
    }

    /// Copy the value of `key` into `buf`, never past its end.
    pub fn get_into(&self, key: &[u8], buf: &mut [u8]) -> Result<GetInto, DbError> {
        self.get_into_opt(&ReadOptions::default(), key, buf)
    }

    pub fn get_into_opt(
        &self,
        opts: &ReadOptions,
        key: &[u8],
        buf: &mut [u8],
    ) -> Result<GetInto, DbError> {
        let Some(value) = self.get_opt(opts, key)? else {
            return Ok(GetInto::NotFound);
        };
        let written = value.len().min(buf.len());
        buf[..written].copy_from_slice(&value[..written]);
        Ok(GetInto::Found {
            len: value.len(),
            written,
        })
    }

    /// Iterator over a snapshot taken now. Later writes are not visible.
    pub fn iter(&self) -> Result<DbIterator, DbError> {
        self.iter_opt(&ReadOptions::default())
    }

    pub fn iter_opt(&self, opts: &ReadOptions) -> Result<DbIterator, DbError> {
        self.check_open()?;
        Ok(self.engine.iter(opts)?)
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------------------------------

    /// Flush the active memtable and every queued one to tables. Blocks.
    pub fn flush(&self) -> Result<(), DbError> {
        self.check_open()?;
        let flushed = self.engine.flush_all()?;
        debug!(flushed, "manual flush");
        if flushed > 0 {
            self.schedule_compaction();
        }
        Ok(())
    }

    /// Merge every table into one. Blocks.
    ///
    /// Returns `false` if there were fewer than two tables.
    pub fn compact_all(&self) -> Result<bool, DbError> {
        self.check_open()?;
        Ok(self.engine.compact_all()?)
    }

    /// The statistics sink of this database.
    pub fn statistics(&self) -> Arc<Statistics> {
        Arc::clone(self.engine.statistics())
    }

    pub fn stats(&self) -> Result<EngineStats, DbError> {
        self.check_open()?;
        Ok(self.engine.stats()?)
    }

    /// Last error met by a background flush or compaction, if any.
    pub fn background_error(&self) -> Option<String> {
        self.engine.background_error()
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }
        Ok(())
    }

    fn lock_bg(&self) -> MutexGuard<'_, Option<BackgroundPool>> {
        self.bg.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn submit(&self, job: Job) {
        if let Some(bg) = self.lock_bg().as_ref() {
            if bg.sender.send(job).is_err() {
                warn!("background pool is gone, job dropped");
            }
        }
    }

    /// Queue a job that flushes the oldest frozen memtable, then compacts.
    /// Queue a flush when a write froze the active memtable. A write can
    /// freeze and then fail to apply; the frozen memtable still needs a
    /// flush or later writers stall on it.
    fn flush_if_frozen(&self, written: &Result<bool, EngineError>) {
        let frozen = match written {
            Ok(froze) => *froze,
            Err(_) => self.engine.frozen_count().is_ok_and(|n| n > 0),
        };
        if frozen {
            self.schedule_flush();
        }
    }

    fn schedule_flush(&self) {
        let engine = self.engine.clone();
        self.submit(Box::new(move || {
            flush_with_retry(&engine);
            compact_until_idle(&engine);
        }));
    }

    fn schedule_compaction(&self) {
        let engine = self.engine.clone();
        self.submit(Box::new(move || compact_until_idle(&engine)));
    }

    /// Drain the job queue and join all workers.
    fn shutdown_pool(&self) {
        let pool = self.lock_bg().take();
        if let Some(bg) = pool {
            // Workers drain remaining jobs, then see the channel closed.
            drop(bg.sender);
            for worker in bg.workers {
                let _ = worker.join();
            }
        }
    }
}

fn check_key(key: &[u8]) -> Result<(), DbError> {
    if key.is_empty() {
        return Err(DbError::InvalidArgument("key must not be empty".into()));
    }
    Ok(())
}

impl Drop for Db {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.engine.begin_shutdown();
            self.shutdown_pool();
            let _ = self.engine.close();
        }
    }
}
