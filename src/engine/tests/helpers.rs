use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::engine::Engine;
use crate::options::{DbOptions, ReadOptions, WriteOptions};
use crate::statistics::Statistics;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Large buffer: nothing is frozen unless a test asks for it.
pub fn memtable_only_options() -> DbOptions {
    init_tracing();
    DbOptions {
        create_if_missing: true,
        max_write_buffer_number: 64,
        ..DbOptions::default()
    }
}

/// 1 KiB buffer, so a few dozen writes freeze the active memtable. Many
/// memtable slots keep single-threaded tests from stalling.
pub fn small_buffer_options() -> DbOptions {
    init_tracing();
    DbOptions {
        create_if_missing: true,
        write_buffer_size: 1024,
        max_write_buffer_number: 64,
        level0_file_num_compaction_trigger: 64,
        ..DbOptions::default()
    }
}

pub fn open(dir: &Path, options: DbOptions) -> Engine {
    Engine::open(dir, options, Arc::new(Statistics::new())).unwrap()
}

pub fn put(engine: &Engine, key: &str, value: &str) -> bool {
    engine
        .put(key.as_bytes().to_vec(), value.as_bytes().to_vec(), &WriteOptions::default())
        .unwrap()
}

pub fn delete(engine: &Engine, key: &str) -> bool {
    engine
        .delete(key.as_bytes().to_vec(), &WriteOptions::default())
        .unwrap()
}

pub fn get(engine: &Engine, key: &str) -> Option<String> {
    engine
        .get(key.as_bytes(), &ReadOptions::default())
        .unwrap()
        .value
        .map(|v| String::from_utf8(v).unwrap())
}

pub fn key(i: usize) -> String {
    format!("key-{i:05}")
}

pub fn value(i: usize, round: usize) -> String {
    format!("value-{i}-round-{round}")
}

/// Write `key(i) -> value(i, round)` for every `i` in `range`.
pub fn fill(engine: &Engine, range: std::ops::Range<usize>, round: usize) {
    for i in range {
        put(engine, &key(i), &value(i, round));
    }
}

/// Every live pair, in key order.
pub fn scan(engine: &Engine) -> Vec<(String, String)> {
    let mut it = engine.iter(&ReadOptions::default()).unwrap();
    let mut out = Vec::new();
    it.seek_to_first();
    while it.valid() {
        out.push((
            String::from_utf8(it.key().unwrap().to_vec()).unwrap(),
            String::from_utf8(it.value().unwrap().to_vec()).unwrap(),
        ));
        it.next();
    }
    it.status().unwrap();
    out
}

/// File names in `dir`, sorted.
pub fn list(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
