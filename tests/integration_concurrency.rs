//! Concurrency tests for the public `Db` API: many writers, readers racing
//! background flushes and compactions, and shutdown while work is queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use sedimentdb::{Db, DbOptions, Ticker};
use tempfile::TempDir;

fn busy_options() -> DbOptions {
    DbOptions {
        create_if_missing: true,
        write_buffer_size: 4 * 1024,
        max_write_buffer_number: 3,
        level0_file_num_compaction_trigger: 3,
        max_background_compactions: 2,
        ..DbOptions::default()
    }
}

/// # Scenario
/// Several writers on disjoint key ranges with a tiny write buffer, so
/// freezes, flushes and compactions all run while they write.
///
/// # Expected behavior
/// Every key reads back its value; every put was counted; no background
/// job failed.
#[test]
fn concurrent_writers_with_background_work() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Db::open(dir.path(), busy_options()).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..500 {
                    db.put(format!("w{t}-{i:05}").as_bytes(), format!("{t}/{i}").as_bytes())
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for t in 0..4 {
        for i in (0..500).step_by(17) {
            assert_eq!(
                db.get(format!("w{t}-{i:05}").as_bytes()).unwrap(),
                Some(format!("{t}/{i}").into_bytes())
            );
        }
    }
    let stats = db.statistics();
    assert_eq!(stats.ticker_count(Ticker::NumberKeysWritten), 2000);
    assert!(stats.ticker_count(Ticker::FlushCount) > 0);
    assert_eq!(db.background_error(), None);
    assert_eq!(db.stats().unwrap().last_sequence, 2000);
    db.close().unwrap();
}

/// # Scenario
/// Readers hammer a fixed key set while a writer keeps overwriting it and
/// the memtables it fills are swapped out and flushed.
///
/// # Expected behavior
/// A reader never sees a key disappear or a value go backwards: memtable
/// swaps and table installs are atomic.
#[test]
fn readers_never_observe_partial_flush() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Db::open(dir.path(), busy_options()).unwrap());
    for k in 0..20 {
        db.put(format!("key{k:02}").as_bytes(), &0u32.to_be_bytes()).unwrap();
    }

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let db = Arc::clone(&db);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut last = [0u32; 20];
                while !done.load(Ordering::Acquire) {
                    for (k, seen) in last.iter_mut().enumerate() {
                        let value = db
                            .get(format!("key{k:02}").as_bytes())
                            .unwrap()
                            .expect("key vanished");
                        let round = u32::from_be_bytes(value[..4].try_into().unwrap());
                        assert!(round >= *seen, "key{k:02} went back from {seen} to {round}");
                        *seen = round;
                    }
                }
            })
        })
        .collect();

    let padding = [0xEEu8; 64];
    for round in 1..=150u32 {
        for k in 0..20 {
            let mut value = round.to_be_bytes().to_vec();
            value.extend_from_slice(&padding);
            db.put(format!("key{k:02}").as_bytes(), &value).unwrap();
        }
    }
    done.store(true, Ordering::Release);
    for r in readers {
        r.join().unwrap();
    }

    assert!(db.statistics().ticker_count(Ticker::FlushCount) > 0);
    db.close().unwrap();
}

#[test]
fn iterators_stay_consistent_under_writes() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Db::open(dir.path(), busy_options()).unwrap());
    for i in 0..200u32 {
        db.put(format!("k{i:04}").as_bytes(), b"base").unwrap();
    }

    let writer = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            for i in 0..200u32 {
                db.put(format!("k{i:04}").as_bytes(), b"updated").unwrap();
                db.put(format!("new{i:04}").as_bytes(), b"x").unwrap();
            }
        })
    };

    for _ in 0..10 {
        let mut it = db.iter().unwrap();
        it.seek(b"k");
        let mut n = 0;
        let mut prev: Option<Vec<u8>> = None;
        while it.valid() {
            let key = it.key().unwrap().to_vec();
            if !key.starts_with(b"k") {
                break;
            }
            if let Some(p) = &prev {
                assert!(p < &key);
            }
            prev = Some(key);
            n += 1;
            it.next();
        }
        it.status().unwrap();
        assert_eq!(n, 200);
    }
    writer.join().unwrap();
    db.close().unwrap();
}

/// # Scenario
/// Closing while flushes are queued leaves everything durable.
#[test]
fn close_with_pending_work_then_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = Db::open(dir.path(), busy_options()).unwrap();
        for i in 0..1000u32 {
            db.put(format!("k{i:05}").as_bytes(), &[1u8; 32]).unwrap();
        }
        db.close().unwrap();
    }
    let db = Db::open(dir.path(), DbOptions::default()).unwrap();
    assert_eq!(db.stats().unwrap().last_sequence, 1000);
    let mut it = db.iter().unwrap();
    it.seek_to_first();
    let mut n = 0;
    while it.valid() {
        n += 1;
        it.next();
    }
    assert_eq!(n, 1000);
    db.close().unwrap();
}
