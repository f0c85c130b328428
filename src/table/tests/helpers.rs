use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::filter::FilterPolicy;
use crate::options::{CompressionType, TableFormat};
use crate::record::Record;
use crate::statistics::Statistics;
use crate::table::{BlockCache, TableBuildOptions, TableHandle, TableReadContext, build_table, table_file_name};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn ctx(cache_capacity: usize) -> TableReadContext {
    TableReadContext {
        cache: (cache_capacity > 0).then(|| Arc::new(BlockCache::new(cache_capacity))),
        stats: Arc::new(Statistics::new()),
    }
}

pub fn build_opts(format: TableFormat) -> TableBuildOptions {
    TableBuildOptions {
        format,
        block_size: 256,
        compression: CompressionType::None,
        filter_policy: Some(FilterPolicy::bloom(10)),
        prefix_len: None,
    }
}

pub fn key(i: u32) -> Vec<u8> {
    format!("key-{i:05}").into_bytes()
}

/// `n` keys in internal order. Even keys carry two versions (the newer
/// one first); every tenth key's newest version is a tombstone.
pub fn records(n: u32) -> Vec<Record> {
    let mut out = Vec::new();
    let mut seq = 10 * u64::from(n);
    for i in 0..n {
        if i % 10 == 0 {
            out.push(Record::tombstone(key(i), seq));
        } else {
            out.push(Record::put(key(i), format!("new-{i}"), seq));
        }
        seq -= 1;
        if i % 2 == 0 {
            out.push(Record::put(key(i), format!("old-{i}"), seq));
            seq -= 1;
        }
    }
    out
}

pub fn path_for(dir: &Path, id: u64) -> PathBuf {
    dir.join(table_file_name(id))
}

/// Build and open table `id` in `dir`.
pub fn build_and_open(
    dir: &Path,
    id: u64,
    opts: &TableBuildOptions,
    records: Vec<Record>,
    ctx: &TableReadContext,
) -> Arc<TableHandle> {
    let path = path_for(dir, id);
    build_table(&path, opts, records).unwrap();
    Arc::new(TableHandle::open(id, &path, ctx).unwrap())
}

pub fn both_formats() -> [TableFormat; 2] {
    [TableFormat::BlockBased, TableFormat::Plain]
}
