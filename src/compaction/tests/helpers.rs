use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::filter::FilterPolicy;
use crate::options::{CompressionType, DbOptions, TableFormat};
use crate::record::Record;
use crate::statistics::Statistics;
use crate::table::{TableBuildOptions, TableHandle, TableReadContext, build_table, table_file_name};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn build_opts() -> TableBuildOptions {
    TableBuildOptions {
        format: TableFormat::BlockBased,
        block_size: 512,
        compression: CompressionType::None,
        filter_policy: Some(FilterPolicy::bloom(10)),
        prefix_len: None,
    }
}

pub fn options(trigger: usize) -> DbOptions {
    DbOptions {
        level0_file_num_compaction_trigger: trigger,
        ..DbOptions::default()
    }
}

/// Open table `id` holding `records` (internal order).
pub fn table(dir: &Path, id: u64, records: Vec<Record>) -> Arc<TableHandle> {
    let path = dir.join(table_file_name(id));
    build_table(&path, &build_opts(), records).unwrap();
    let ctx = TableReadContext {
        cache: None,
        stats: Arc::new(Statistics::new()),
    };
    Arc::new(TableHandle::open(id, &path, &ctx).unwrap())
}

/// A table of `n` distinct puts, `value_len` bytes each, keys prefixed
/// with `tag`.
pub fn sized_table(dir: &Path, id: u64, tag: &str, n: u32, value_len: usize) -> Arc<TableHandle> {
    let records = (0..n)
        .map(|i| Record::put(format!("{tag}-{i:05}"), vec![b'v'; value_len], id * 10_000 + u64::from(i)))
        .collect();
    table(dir, id, records)
}

pub fn ids(tables: &[Arc<TableHandle>]) -> Vec<u64> {
    tables.iter().map(|t| t.id()).collect()
}
