//! Integration tests for the public `Db` API.
//!
//! These tests exercise the full storage stack (WAL → memtable → table →
//! compaction) through the public `sedimentdb` surface only.
//!
//! ## Coverage areas
//! - **Lifecycle**: open flags, close, idempotent close, drop without close
//! - **CRUD**: put, get, get_into, delete, overwrite, empty values
//! - **Iteration**: ordering, snapshots, tombstones, both directions
//! - **Variants**: every memtable representation with both table formats
//! - **Persistence**: reopen after close and after flush + compaction
//! - **Background work**: flush accounting, failed flushes, failed writes
//! - **Config validation** and closed-handle errors

use sedimentdb::{
    CompressionType, Db, DbError, DbOptions, FilterPolicy, GetInto, MemTableConfig, ReadOptions,
    TableFormat, Ticker, WriteOptions,
};
use std::time::{Duration, Instant};

use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn create_options() -> DbOptions {
    DbOptions {
        create_if_missing: true,
        ..DbOptions::default()
    }
}

/// Small write buffer so a few hundred writes flush in the background.
fn small_buffer_options() -> DbOptions {
    DbOptions {
        write_buffer_size: 2048,
        max_write_buffer_number: 3,
        ..create_options()
    }
}

/// Poll `cond` until it holds or `timeout` passes.
fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Key `k0000`..`k9999` with a 78-byte value: each record charges exactly
/// 100 bytes (5 + 78 + 17 bytes of overhead) against the write buffer.
fn hundred_byte_record(i: u32) -> (Vec<u8>, Vec<u8>) {
    (format!("k{i:04}").into_bytes(), vec![b'v'; 78])
}

fn reopen(path: &std::path::Path) -> Db {
    Db::open(path, DbOptions::default()).expect("reopen")
}

/// The 81 `"i x j" -> "i*j"` pairs for `i, j` in `1..=9`.
fn multiplication_table() -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for i in 1..=9 {
        for j in 1..=9 {
            pairs.push((format!("{i} x {j}"), (i * j).to_string()));
        }
    }
    pairs
}

fn walk_forward(db: &Db) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut it = db.iter().unwrap();
    let mut out = Vec::new();
    it.seek_to_first();
    while it.valid() {
        out.push((it.key().unwrap().to_vec(), it.value().unwrap().to_vec()));
        it.next();
    }
    it.status().unwrap();
    out
}

fn walk_backward(db: &Db) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut it = db.iter().unwrap();
    let mut out = Vec::new();
    it.seek_to_last();
    while it.valid() {
        out.push((it.key().unwrap().to_vec(), it.value().unwrap().to_vec()));
        it.prev();
    }
    it.status().unwrap();
    out
}

// ================================================================================================
// Lifecycle
// ================================================================================================

/// # Scenario
/// Opening a directory without a database needs `create_if_missing`.
///
/// # Expected behavior
/// `NotFound` without the flag; with it the database is created and a
/// plain reopen then works.
#[test]
fn open_requires_create_if_missing() {
    let dir = TempDir::new().unwrap();
    let err = Db::open(dir.path(), DbOptions::default()).unwrap_err();
    assert!(matches!(err, DbError::NotFound(_)), "{err:?}");

    Db::open(dir.path(), create_options()).unwrap().close().unwrap();
    reopen(dir.path()).close().unwrap();
}

#[test]
fn open_error_if_exists() {
    let dir = TempDir::new().unwrap();
    Db::open(dir.path(), create_options()).unwrap().close().unwrap();

    let options = DbOptions {
        error_if_exists: true,
        ..create_options()
    };
    let err = Db::open(dir.path(), options).unwrap_err();
    assert!(matches!(err, DbError::InvalidArgument(_)), "{err:?}");
}

#[test]
fn open_rejects_invalid_config() {
    let dir = TempDir::new().unwrap();
    let cases = [
        DbOptions {
            write_buffer_size: 0,
            ..create_options()
        },
        DbOptions {
            max_write_buffer_number: 1,
            ..create_options()
        },
        DbOptions {
            level0_file_num_compaction_trigger: 1,
            ..create_options()
        },
        DbOptions {
            fixed_prefix_len: Some(0),
            ..create_options()
        },
        DbOptions {
            filter_policy: Some(FilterPolicy::bloom(0)),
            ..create_options()
        },
    ];
    for options in cases {
        let err = Db::open(dir.path(), options).unwrap_err();
        assert!(matches!(err, DbError::InvalidConfig(_)), "{err:?}");
    }
    // Nothing was created.
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}

#[test]
fn close_is_idempotent_and_final() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), create_options()).unwrap();
    db.close().unwrap();
    db.close().unwrap();

    assert!(matches!(db.put(b"k", b"v"), Err(DbError::Closed)));
    assert!(matches!(db.get(b"k"), Err(DbError::Closed)));
    assert!(matches!(db.delete(b"k"), Err(DbError::Closed)));
    assert!(matches!(db.iter(), Err(DbError::Closed)));
    assert!(matches!(db.flush(), Err(DbError::Closed)));
}

/// # Scenario
/// Dropping the handle without `close` still leaves the data durable.
#[test]
fn drop_without_close() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), create_options()).unwrap();
    db.put(b"key", b"value").unwrap();
    drop(db);

    let db = reopen(dir.path());
    assert_eq!(db.get(b"key").unwrap(), Some(b"value".to_vec()));
    db.close().unwrap();
}

// ================================================================================================
// CRUD
// ================================================================================================

/// # Scenario
/// The basic write/read/delete cycle on an 8 KiB write buffer.
///
/// # Actions
/// 1. Put `hello -> world`.
/// 2. Get `hello` and `missing`.
/// 3. Delete `hello` and get it again.
///
/// # Expected behavior
/// `world`, then absent for `missing`, then absent for `hello`.
#[test]
fn put_get_delete() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(
        dir.path(),
        DbOptions {
            write_buffer_size: 8 * 1024,
            ..create_options()
        },
    )
    .unwrap();

    db.put(b"hello", b"world").unwrap();
    assert_eq!(db.get(b"hello").unwrap(), Some(b"world".to_vec()));
    assert_eq!(db.get(b"missing").unwrap(), None);

    db.delete(b"hello").unwrap();
    assert_eq!(db.get(b"hello").unwrap(), None);
    db.close().unwrap();
}

#[test]
fn empty_key_is_rejected_empty_value_is_kept() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), create_options()).unwrap();

    assert!(matches!(db.put(b"", b"v"), Err(DbError::InvalidArgument(_))));
    assert!(matches!(db.delete(b""), Err(DbError::InvalidArgument(_))));
    assert!(matches!(db.get(b""), Err(DbError::InvalidArgument(_))));

    db.put(b"k", b"").unwrap();
    assert_eq!(db.get(b"k").unwrap(), Some(Vec::new()));
    db.close().unwrap();
}

/// # Scenario
/// `get_into` never writes past the caller's buffer and always reports
/// the full value length.
#[test]
fn get_into_reports_true_length() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), create_options()).unwrap();
    let value: Vec<u8> = (0..=255u8).collect();
    db.put(b"bytes", &value).unwrap();

    let mut small = [0xAAu8; 10];
    assert_eq!(
        db.get_into(b"bytes", &mut small).unwrap(),
        GetInto::Found { len: 256, written: 10 }
    );
    assert_eq!(&small[..], &value[..10]);

    let mut large = vec![0u8; 300];
    assert_eq!(
        db.get_into(b"bytes", &mut large).unwrap(),
        GetInto::Found { len: 256, written: 256 }
    );
    assert_eq!(&large[..256], &value[..]);
    assert!(large[256..].iter().all(|&b| b == 0));

    let mut empty = [];
    assert_eq!(
        db.get_into(b"bytes", &mut empty).unwrap(),
        GetInto::Found { len: 256, written: 0 }
    );
    assert_eq!(db.get_into(b"nope", &mut small).unwrap(), GetInto::NotFound);
    db.close().unwrap();
}

/// # Scenario
/// The last write per key wins regardless of which layers hold the
/// older versions.
#[test]
fn last_write_wins_across_flushes() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), create_options()).unwrap();

    for round in 0..4u32 {
        for i in 0..50u32 {
            let key = format!("k{i:03}");
            if (i + round) % 3 == 0 {
                db.delete(key.as_bytes()).unwrap();
            } else {
                db.put(key.as_bytes(), format!("{round}").as_bytes()).unwrap();
            }
        }
        db.flush().unwrap();
    }

    for i in 0..50u32 {
        let expected = ((i + 3) % 3 != 0).then(|| b"3".to_vec());
        assert_eq!(db.get(format!("k{i:03}").as_bytes()).unwrap(), expected, "k{i:03}");
    }
    db.close().unwrap();
}

// ================================================================================================
// Iteration
// ================================================================================================

/// # Scenario
/// The 81-key multiplication table comes back in byte order exactly once,
/// with the writes split across two tables and the active memtable.
#[test]
fn iterate_multiplication_table() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), create_options()).unwrap();
    let pairs = multiplication_table();

    for (n, (k, v)) in pairs.iter().enumerate() {
        db.put(k.as_bytes(), v.as_bytes()).unwrap();
        if n == 30 || n == 60 {
            db.flush().unwrap();
        }
    }

    let mut expected: Vec<(Vec<u8>, Vec<u8>)> = pairs
        .into_iter()
        .map(|(k, v)| (k.into_bytes(), v.into_bytes()))
        .collect();
    expected.sort();

    let forward = walk_forward(&db);
    assert_eq!(forward.len(), 81);
    assert_eq!(forward, expected);
    assert!(forward.windows(2).all(|w| w[0].0 < w[1].0));

    let mut backward = walk_backward(&db);
    backward.reverse();
    assert_eq!(backward, expected);
    db.close().unwrap();
}

/// # Scenario
/// An iterator never sees writes committed after it was created, even
/// across a flush and a compaction.
#[test]
fn iterator_is_a_snapshot() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), create_options()).unwrap();
    db.put(b"a", b"1").unwrap();
    db.put(b"c", b"3").unwrap();

    let mut it = db.iter().unwrap();
    db.put(b"b", b"2").unwrap();
    db.put(b"a", b"changed").unwrap();
    db.delete(b"c").unwrap();
    db.flush().unwrap();
    db.compact_all().unwrap();

    it.seek_to_first();
    let mut seen = Vec::new();
    while it.valid() {
        seen.push((it.key().unwrap().to_vec(), it.value().unwrap().to_vec()));
        it.next();
    }
    assert_eq!(
        seen,
        vec![(b"a".to_vec(), b"1".to_vec()), (b"c".to_vec(), b"3".to_vec())]
    );
    drop(it);

    assert_eq!(
        walk_forward(&db),
        vec![(b"a".to_vec(), b"changed".to_vec()), (b"b".to_vec(), b"2".to_vec())]
    );
    db.close().unwrap();
}

#[test]
fn iterator_seek_and_reverse() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), create_options()).unwrap();
    for i in (0..100u32).step_by(10) {
        db.put(format!("{i:03}").as_bytes(), b"v").unwrap();
    }
    db.delete(b"050").unwrap();

    let mut it = db.iter().unwrap();
    it.seek(b"045");
    assert_eq!(it.key(), Some(&b"060"[..]));
    it.prev();
    assert_eq!(it.key(), Some(&b"040"[..]));
    it.next();
    assert_eq!(it.key(), Some(&b"060"[..]));

    it.seek(b"999");
    assert!(!it.valid());
    it.seek_to_last();
    assert_eq!(it.key(), Some(&b"090"[..]));
    it.status().unwrap();
    db.close().unwrap();
}

// ================================================================================================
// Variants
// ================================================================================================

/// # Scenario
/// Every memtable representation works with both table formats.
#[test]
fn every_memtable_with_every_table_format() {
    let memtables = [
        MemTableConfig::SkipList,
        MemTableConfig::hash_skip_list(),
        MemTableConfig::hash_linked_list(),
        MemTableConfig::vector(),
    ];
    for memtable in memtables {
        for table_format in [TableFormat::BlockBased, TableFormat::Plain] {
            let dir = TempDir::new().unwrap();
            let db = Db::open(
                dir.path(),
                DbOptions {
                    memtable,
                    table_format,
                    fixed_prefix_len: Some(1),
                    compression: CompressionType::Snappy,
                    ..create_options()
                },
            )
            .unwrap();

            let pairs = multiplication_table();
            for (k, v) in pairs.iter().take(40) {
                db.put(k.as_bytes(), v.as_bytes()).unwrap();
            }
            db.flush().unwrap();
            for (k, v) in pairs.iter().skip(40) {
                db.put(k.as_bytes(), v.as_bytes()).unwrap();
            }
            db.delete(b"5 x 5").unwrap();

            let label = format!("{memtable:?} / {table_format:?}");
            assert_eq!(db.get(b"3 x 7").unwrap(), Some(b"21".to_vec()), "{label}");
            assert_eq!(db.get(b"9 x 9").unwrap(), Some(b"81".to_vec()), "{label}");
            assert_eq!(db.get(b"5 x 5").unwrap(), None, "{label}");
            assert_eq!(walk_forward(&db).len(), 80, "{label}");
            db.close().unwrap();

            let db = Db::open(
                dir.path(),
                DbOptions {
                    memtable,
                    table_format,
                    fixed_prefix_len: Some(1),
                    ..DbOptions::default()
                },
            )
            .unwrap();
            assert_eq!(db.get(b"1 x 1").unwrap(), Some(b"1".to_vec()), "{label}");
            assert_eq!(walk_forward(&db).len(), 80, "{label}");
            db.close().unwrap();
        }
    }
}

// ================================================================================================
// Persistence
// ================================================================================================

#[test]
fn data_survives_flush_compaction_and_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = Db::open(dir.path(), small_buffer_options()).unwrap();
        for i in 0..500u32 {
            db.put(format!("key-{i:04}").as_bytes(), format!("v{i}").as_bytes())
                .unwrap();
        }
        for i in (0..500u32).step_by(5) {
            db.delete(format!("key-{i:04}").as_bytes()).unwrap();
        }
        db.flush().unwrap();
        db.compact_all().unwrap();
        db.put(b"tail", b"unflushed").unwrap();
        db.close().unwrap();
    }

    let db = reopen(dir.path());
    assert_eq!(db.stats().unwrap().table_count, 1);
    assert_eq!(db.get(b"key-0001").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(db.get(b"key-0005").unwrap(), None);
    assert_eq!(db.get(b"tail").unwrap(), Some(b"unflushed".to_vec()));
    assert_eq!(walk_forward(&db).len(), 401);
    db.close().unwrap();
}

#[test]
fn unlogged_writes_survive_clean_close() {
    let dir = TempDir::new().unwrap();
    {
        let db = Db::open(dir.path(), create_options()).unwrap();
        let opts = WriteOptions {
            disable_wal: true,
            ..WriteOptions::default()
        };
        db.put_opt(&opts, b"fast", b"write").unwrap();
        db.delete_opt(&WriteOptions { sync: true, disable_wal: false }, b"other")
            .unwrap();
        db.close().unwrap();
    }
    let db = reopen(dir.path());
    assert_eq!(db.get(b"fast").unwrap(), Some(b"write".to_vec()));
    db.close().unwrap();
}

// ================================================================================================
// Statistics
// ================================================================================================

/// # Scenario
/// The keys-written ticker counts every successful put, through
/// background flushes and a manual compaction.
#[test]
fn keys_written_ticker_is_exact() {
    let dir = TempDir::new().unwrap();
    let mut options = small_buffer_options();
    let stats = options.create_statistics();
    let db = Db::open(dir.path(), options).unwrap();

    for i in 0..300u32 {
        db.put(format!("k{i}").as_bytes(), &[7u8; 40]).unwrap();
    }
    let _ = db.put(b"", b"rejected");
    db.flush().unwrap();
    db.compact_all().unwrap();
    for i in 0..20u32 {
        db.put(format!("late{i}").as_bytes(), b"x").unwrap();
    }

    assert_eq!(stats.ticker_count(Ticker::NumberKeysWritten), 320);
    assert!(stats.ticker_count(Ticker::FlushCount) > 0);
    assert!(std::sync::Arc::ptr_eq(&stats, &db.statistics()));
    db.close().unwrap();
}

#[test]
fn read_options_fill_cache_false_leaves_cache_cold() {
    let dir = TempDir::new().unwrap();
    let mut options = create_options();
    let stats = options.create_statistics();
    let db = Db::open(dir.path(), options).unwrap();
    db.put(b"k", b"v").unwrap();
    db.flush().unwrap();

    let no_fill = ReadOptions { fill_cache: false };
    assert_eq!(db.get_opt(&no_fill, b"k").unwrap(), Some(b"v".to_vec()));
    assert_eq!(stats.ticker_count(Ticker::BlockCacheAdd), 0);

    assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
    assert_eq!(stats.ticker_count(Ticker::BlockCacheAdd), 1);
    assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
    assert_eq!(stats.ticker_count(Ticker::BlockCacheHit), 1);
    db.close().unwrap();
}

// ================================================================================================
// Background work
// ================================================================================================

/// # Scenario
/// With a 1000-byte write buffer and 100-byte records, the active memtable
/// fills after 10 writes and the 11th write freezes it first.
///
/// # Actions
/// 1. Write 100 records (freezes before writes 11, 21, ..., 91).
/// 2. Flush manually (flushes the 10 records left in the active memtable).
///
/// # Expected behavior
/// Exactly 10 flushes are counted, one per 1000 bytes written.
#[test]
fn flush_count_is_one_per_write_buffer() {
    let dir = TempDir::new().unwrap();
    let mut options = DbOptions {
        write_buffer_size: 1000,
        max_write_buffer_number: 4,
        ..create_options()
    };
    let stats = options.create_statistics();
    let db = Db::open(dir.path(), options).unwrap();

    for i in 0..100 {
        let (k, v) = hundred_byte_record(i);
        db.put(&k, &v).unwrap();
    }
    assert!(wait_until(Duration::from_secs(10), || {
        stats.ticker_count(Ticker::FlushCount) == 9
    }));
    assert_eq!(db.stats().unwrap().active_memtable_bytes, 1000);

    db.flush().unwrap();
    assert_eq!(stats.ticker_count(Ticker::FlushCount), 10);
    assert_eq!(db.stats().unwrap().frozen_count, 0);
    assert_eq!(walk_forward(&db).len(), 100);
    db.close().unwrap();
}

/// # Scenario
/// Background flushes fail while the table directory is unusable.
///
/// # Actions
/// 1. Replace `tables/` with a plain file so table creation fails.
/// 2. Write until every memtable slot is taken.
/// 3. Put `tables/` back.
///
/// # Expected behavior
/// - The failure is reported through `background_error` and the
///   background-errors ticker.
/// - Writes keep succeeding until `max_write_buffer_number` memtables
///   are live.
/// - Once the directory is back, the retried flushes succeed and the
///   data reads back.
#[cfg(unix)]
#[test]
fn failed_background_flush_is_reported_and_retried() {
    let dir = TempDir::new().unwrap();
    let mut options = DbOptions {
        write_buffer_size: 1000,
        max_write_buffer_number: 3,
        ..create_options()
    };
    let stats = options.create_statistics();
    let db = Db::open(dir.path(), options).unwrap();

    let tables = dir.path().join("tables");
    let parked = dir.path().join("tables.parked");
    std::fs::rename(&tables, &parked).unwrap();
    std::fs::write(&tables, b"not a directory").unwrap();

    // 30 writes fill three memtables; the 11th and 21st freeze one each.
    for i in 0..30 {
        let (k, v) = hundred_byte_record(i);
        db.put(&k, &v).unwrap();
    }
    assert!(wait_until(Duration::from_secs(10), || db.background_error().is_some()));
    assert!(stats.ticker_count(Ticker::BackgroundErrors) > 0);
    assert_eq!(stats.ticker_count(Ticker::FlushCount), 0);
    assert_eq!(db.stats().unwrap().frozen_count, 2);
    assert_eq!(db.get(b"k0000").unwrap(), Some(vec![b'v'; 78]));

    std::fs::remove_file(&tables).unwrap();
    std::fs::rename(&parked, &tables).unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        db.stats().unwrap().frozen_count == 0
    }));
    assert_eq!(stats.ticker_count(Ticker::FlushCount), 2);
    assert!(db.stats().unwrap().table_count >= 1);

    let (k, v) = hundred_byte_record(30);
    db.put(&k, &v).unwrap();
    assert_eq!(walk_forward(&db).len(), 31);
    db.close().unwrap();
}

/// # Scenario
/// A write freezes the full active memtable and then fails in the WAL
/// because the record is over the WAL record limit.
///
/// # Expected behavior
/// The memtable frozen by the failed write is still flushed, so later
/// writers never stall on it.
#[test]
fn failed_write_still_flushes_the_memtable_it_froze() {
    let dir = TempDir::new().unwrap();
    let db = Db::open(
        dir.path(),
        DbOptions {
            write_buffer_size: 1000,
            max_write_buffer_number: 2,
            ..create_options()
        },
    )
    .unwrap();

    for i in 0..10 {
        let (k, v) = hundred_byte_record(i);
        db.put(&k, &v).unwrap();
    }
    let oversized = vec![0u8; 64 * 1024 * 1024 + 1];
    assert!(db.put(b"huge", &oversized).is_err());
    drop(oversized);

    assert!(wait_until(Duration::from_secs(10), || {
        db.stats().unwrap().frozen_count == 0
    }));
    assert_eq!(db.get(b"huge").unwrap(), None);

    // Two more buffers' worth would stall forever behind an unflushed one.
    for i in 10..30 {
        let (k, v) = hundred_byte_record(i);
        db.put(&k, &v).unwrap();
    }
    assert_eq!(walk_forward(&db).len(), 30);
    db.close().unwrap();
}
