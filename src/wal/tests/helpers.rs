use std::path::{Path, PathBuf};

use tracing_subscriber::EnvFilter;

use crate::record::Record;
use crate::wal::{Wal, WalError, segment_file_name};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(segment_file_name(id))
}

pub fn record(i: u64) -> Record {
    Record::put(format!("key-{i:04}"), format!("value-{i}"), i + 1)
}

/// Replay everything, stopping at the first error.
pub fn collect(wal: &Wal<Record>) -> (Vec<Record>, Option<WalError>) {
    let mut records = Vec::new();
    for item in wal.replay_iter() {
        match item {
            Ok(r) => records.push(r),
            Err(e) => return (records, Some(e)),
        }
    }
    (records, None)
}
