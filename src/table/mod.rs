//! Immutable on-disk sorted tables.
//!
//! A table is written once, from records already in internal order (a
//! frozen memtable or a compaction merge), and is read-only afterwards. Two
//! layouts share the same framing, properties and footer:
//!
//! - [`BlockBasedTable`]: records grouped into `block_size` blocks, each
//!   checksummed, optionally Snappy-compressed and cacheable, behind a sparse
//!   index of block-starting keys.
//! - [`PlainTable`]: a single contiguous run of records read straight from
//!   the memory map through a per-record offset index, optionally narrowed
//!   by a key-prefix index.
//!
//! # File layout
//!
//! ```text
//! [DATA (blocks or one contiguous run)]
//! [FILTER BLOCK]      optional Bloom filter over distinct keys
//! [INDEX BLOCK]       format-specific
//! [PROPERTIES BLOCK]  TableProperties
//! [FOOTER]            format u8 | filter | index | properties handles | magic | crc32
//! ```
//!
//! Every block is followed by a 5-byte trailer: compression type (`u8`)
//! and a CRC32 over `payload || type`. The footer carries its own CRC32.
//!
//! Files are written to a `.tmp` sibling, fsynced, then renamed into place.

#[cfg(test)]
mod tests;

mod block_based;
mod plain;

pub use block_based::{Block, BlockBasedTable};
pub use plain::PlainTable;

use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::LruCache;
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::filter::{FilterError, FilterPolicy, KeyFilter};
use crate::iterator::RecordCursor;
use crate::options::{CompressionType, TableFormat};
use crate::record::{Record, SequenceNumber};
use crate::statistics::{Statistics, Ticker};

/// Magic constant closing every table file.
pub const TABLE_MAGIC: [u8; 4] = *b"SDTB";

/// format + 3 handles + magic + crc
pub const FOOTER_SIZE: usize = 1 + 3 * BlockHandle::ENCODED_LEN + 4 + 4;

/// compression type + crc
pub const BLOCK_TRAILER_SIZE: usize = 1 + 4;

/// A table is charged one seek per this many bytes of file size before a
/// read-triggered compaction is considered.
const BYTES_PER_SEEK: u64 = 16 * 1024;
const MIN_ALLOWED_SEEKS: i64 = 100;

const COMPRESSION_NONE: u8 = 0;
const COMPRESSION_SNAPPY: u8 = 1;

/// Decoded data blocks shared across tables, keyed by `(table id, offset)`.
pub type BlockCache = LruCache<(u64, u64), Arc<Block>>;

/// File name of table `id`.
pub fn table_file_name(id: u64) -> String {
    format!("{id:06}.sst")
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TableError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Checksum, magic, bounds or decompression failure.
    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Shared on-disk structures
// ------------------------------------------------------------------------------------------------

/// Location of a block payload (trailer excluded).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub const ENCODED_LEN: usize = 16;
}

impl Encode for BlockHandle {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.offset.encode_to(buf)?;
        self.size.encode_to(buf)
    }
}

impl Decode for BlockHandle {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (offset, _) = u64::decode_from(buf)?;
        let (size, _) = u64::decode_from(&buf[8..])?;
        Ok((Self { offset, size }, Self::ENCODED_LEN))
    }
}

/// Summary written into every table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableProperties {
    pub format: TableFormat,
    pub compression: CompressionType,
    pub num_entries: u64,
    pub num_deletions: u64,
    pub num_data_blocks: u64,
    pub raw_key_size: u64,
    pub raw_value_size: u64,
    pub smallest_key: Vec<u8>,
    pub largest_key: Vec<u8>,
    pub min_seq: SequenceNumber,
    pub max_seq: SequenceNumber,
    /// Bloom bits per key; 0 when the table has no filter.
    pub filter_bits_per_key: u32,
    /// Prefix length of the plain-table prefix index; 0 when absent.
    pub prefix_len: u32,
}

fn format_tag(format: TableFormat) -> u8 {
    match format {
        TableFormat::BlockBased => 0,
        TableFormat::Plain => 1,
    }
}

fn format_from_tag(tag: u8) -> Result<TableFormat, EncodingError> {
    match tag {
        0 => Ok(TableFormat::BlockBased),
        1 => Ok(TableFormat::Plain),
        other => Err(EncodingError::InvalidTag {
            tag: u32::from(other),
            type_name: "TableFormat",
        }),
    }
}

impl Encode for TableProperties {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        format_tag(self.format).encode_to(buf)?;
        let compression = match self.compression {
            CompressionType::None => COMPRESSION_NONE,
            CompressionType::Snappy => COMPRESSION_SNAPPY,
        };
        compression.encode_to(buf)?;
        self.num_entries.encode_to(buf)?;
        self.num_deletions.encode_to(buf)?;
        self.num_data_blocks.encode_to(buf)?;
        self.raw_key_size.encode_to(buf)?;
        self.raw_value_size.encode_to(buf)?;
        self.smallest_key.encode_to(buf)?;
        self.largest_key.encode_to(buf)?;
        self.min_seq.encode_to(buf)?;
        self.max_seq.encode_to(buf)?;
        self.filter_bits_per_key.encode_to(buf)?;
        self.prefix_len.encode_to(buf)
    }
}

impl Decode for TableProperties {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        macro_rules! field {
            ($ty:ty) => {{
                let (value, used) = <$ty>::decode_from(&buf[offset..])?;
                offset += used;
                value
            }};
        }
        let format = format_from_tag(field!(u8))?;
        let compression = match field!(u8) {
            COMPRESSION_NONE => CompressionType::None,
            COMPRESSION_SNAPPY => CompressionType::Snappy,
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: u32::from(other),
                    type_name: "CompressionType",
                });
            }
        };
        let props = Self {
            format,
            compression,
            num_entries: field!(u64),
            num_deletions: field!(u64),
            num_data_blocks: field!(u64),
            raw_key_size: field!(u64),
            raw_value_size: field!(u64),
            smallest_key: field!(Vec<u8>),
            largest_key: field!(Vec<u8>),
            min_seq: field!(u64),
            max_seq: field!(u64),
            filter_bits_per_key: field!(u32),
            prefix_len: field!(u32),
        };
        Ok((props, offset))
    }
}

/// Fixed-size trailer locating the metadata blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub format: TableFormat,
    pub filter: Option<BlockHandle>,
    pub index: BlockHandle,
    pub properties: BlockHandle,
}

impl Footer {
    fn encode(&self) -> Result<Vec<u8>, EncodingError> {
        let mut buf = Vec::with_capacity(FOOTER_SIZE);
        format_tag(self.format).encode_to(&mut buf)?;
        // A zero-sized handle stands for "no filter".
        self.filter.unwrap_or_default().encode_to(&mut buf)?;
        self.index.encode_to(&mut buf)?;
        self.properties.encode_to(&mut buf)?;
        buf.extend_from_slice(&TABLE_MAGIC);
        let crc = crc32fast::hash(&buf);
        crc.encode_to(&mut buf)?;
        Ok(buf)
    }

    fn decode(file: &[u8]) -> Result<Self, TableError> {
        if file.len() < FOOTER_SIZE {
            return Err(TableError::Corruption(format!(
                "file too small for footer ({} bytes)",
                file.len()
            )));
        }
        let raw = &file[file.len() - FOOTER_SIZE..];
        let (body, crc) = raw.split_at(FOOTER_SIZE - 4);
        let (stored, _) = u32::decode_from(crc)?;
        if crc32fast::hash(body) != stored {
            return Err(TableError::Corruption("footer checksum mismatch".into()));
        }
        if body[body.len() - 4..] != TABLE_MAGIC {
            return Err(TableError::Corruption("bad table magic".into()));
        }

        let format = format_from_tag(body[0])?;
        let mut offset = 1;
        let mut handle = || -> Result<BlockHandle, EncodingError> {
            let (h, used) = BlockHandle::decode_from(&body[offset..])?;
            offset += used;
            Ok(h)
        };
        let filter = handle()?;
        let index = handle()?;
        let properties = handle()?;
        Ok(Self {
            format,
            filter: (filter.size > 0).then_some(filter),
            index,
            properties,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Block framing
// ------------------------------------------------------------------------------------------------

/// Position-tracking writer used by the builders.
pub(crate) struct TableWriter {
    out: BufWriter<File>,
    offset: u64,
}

impl TableWriter {
    fn create(path: &Path) -> Result<Self, TableError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            out: BufWriter::new(file),
            offset: 0,
        })
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<(), TableError> {
        self.out.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    /// Write `payload` plus trailer, compressing when asked and worthwhile
    /// (at least 1/8 smaller).
    pub(crate) fn write_block(
        &mut self,
        payload: &[u8],
        compression: CompressionType,
    ) -> Result<BlockHandle, TableError> {
        let compressed = match compression {
            CompressionType::Snappy => snap::raw::Encoder::new()
                .compress_vec(payload)
                .ok()
                .filter(|c| c.len() < payload.len() - payload.len() / 8),
            CompressionType::None => None,
        };
        let (bytes, kind) = match &compressed {
            Some(c) => (c.as_slice(), COMPRESSION_SNAPPY),
            None => (payload, COMPRESSION_NONE),
        };

        let handle = BlockHandle {
            offset: self.offset,
            size: bytes.len() as u64,
        };
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(bytes);
        hasher.update(&[kind]);
        let crc = hasher.finalize();

        self.write_raw(bytes)?;
        self.write_raw(&[kind])?;
        self.write_raw(&crc.to_le_bytes())?;
        Ok(handle)
    }

    fn finish(mut self, footer: &Footer) -> Result<u64, TableError> {
        self.write_raw(&footer.encode()?)?;
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(self.offset)
    }
}

/// Read and verify the block at `handle`, decompressing if needed.
pub(crate) fn read_block(file: &[u8], handle: BlockHandle) -> Result<Cow<'_, [u8]>, TableError> {
    let start = usize::try_from(handle.offset)
        .map_err(|_| TableError::Corruption("block offset overflow".into()))?;
    let size = usize::try_from(handle.size)
        .map_err(|_| TableError::Corruption("block size overflow".into()))?;
    let end = start
        .checked_add(size)
        .and_then(|end| end.checked_add(BLOCK_TRAILER_SIZE))
        .filter(|&end| end <= file.len())
        .ok_or_else(|| {
            TableError::Corruption(format!(
                "block {}+{} beyond file end {}",
                handle.offset,
                handle.size,
                file.len()
            ))
        })?;

    let payload = &file[start..start + size];
    let kind = file[start + size];
    let (stored, _) = u32::decode_from(&file[start + size + 1..end])?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.update(&[kind]);
    if hasher.finalize() != stored {
        return Err(TableError::Corruption(format!(
            "block checksum mismatch at offset {}",
            handle.offset
        )));
    }

    match kind {
        COMPRESSION_NONE => Ok(Cow::Borrowed(payload)),
        COMPRESSION_SNAPPY => snap::raw::Decoder::new()
            .decompress_vec(payload)
            .map(Cow::Owned)
            .map_err(|e| TableError::Corruption(format!("snappy: {e}"))),
        other => Err(TableError::Corruption(format!(
            "unknown compression type {other}"
        ))),
    }
}

// ------------------------------------------------------------------------------------------------
// Building
// ------------------------------------------------------------------------------------------------

/// Parameters for writing one table.
#[derive(Debug, Clone)]
pub struct TableBuildOptions {
    pub format: TableFormat,
    pub block_size: usize,
    pub compression: CompressionType,
    pub filter_policy: Option<FilterPolicy>,
    pub prefix_len: Option<usize>,
}

/// Running statistics collected while records stream into a builder.
#[derive(Default)]
pub(crate) struct PropertiesCollector {
    props: TableProperties,
    filter_keys: Vec<Vec<u8>>,
    collect_filter_keys: bool,
}

impl PropertiesCollector {
    fn new(opts: &TableBuildOptions) -> Self {
        Self {
            props: TableProperties {
                format: opts.format,
                compression: match opts.format {
                    TableFormat::BlockBased => opts.compression,
                    TableFormat::Plain => CompressionType::None,
                },
                min_seq: SequenceNumber::MAX,
                ..TableProperties::default()
            },
            filter_keys: Vec::new(),
            collect_filter_keys: opts.filter_policy.is_some(),
        }
    }

    pub(crate) fn add(&mut self, record: &Record) {
        let props = &mut self.props;
        if props.num_entries == 0 {
            props.smallest_key = record.key.clone();
        }
        let new_key = props.num_entries == 0 || props.largest_key != record.key;
        if new_key {
            props.largest_key = record.key.clone();
            if self.collect_filter_keys {
                self.filter_keys.push(record.key.clone());
            }
        }
        props.num_entries += 1;
        props.raw_key_size += record.key.len() as u64;
        match &record.value {
            Some(value) => props.raw_value_size += value.len() as u64,
            None => props.num_deletions += 1,
        }
        props.min_seq = props.min_seq.min(record.seq);
        props.max_seq = props.max_seq.max(record.seq);
    }

    fn write_filter(
        &mut self,
        writer: &mut TableWriter,
        policy: Option<FilterPolicy>,
    ) -> Result<Option<BlockHandle>, TableError> {
        let Some(policy) = policy else {
            return Ok(None);
        };
        let FilterPolicy::Bloom { bits_per_key } = policy;
        self.props.filter_bits_per_key = u32::try_from(bits_per_key).unwrap_or(u32::MAX);
        let keys = std::mem::take(&mut self.filter_keys);
        let filter = policy.create_filter(keys.iter().map(Vec::as_slice), keys.len())?;
        Ok(Some(writer.write_block(&filter, CompressionType::None)?))
    }

    fn finish(mut self) -> TableProperties {
        if self.props.num_entries == 0 {
            self.props.min_seq = 0;
        }
        self.props
    }
}

/// Result of writing a table file.
#[derive(Debug, Clone)]
pub struct BuiltTable {
    pub path: PathBuf,
    pub file_size: u64,
    pub properties: TableProperties,
}

/// Write `records` (internal order, non-empty) to `path`.
pub fn build_table<I>(
    path: &Path,
    opts: &TableBuildOptions,
    records: I,
) -> Result<BuiltTable, TableError>
where
    I: IntoIterator<Item = Record>,
{
    let tmp_path = path.with_extension("tmp");
    let mut writer = TableWriter::create(&tmp_path)?;
    let mut collector = PropertiesCollector::new(opts);

    let index = match opts.format {
        TableFormat::BlockBased => {
            block_based::write_data(&mut writer, &mut collector, opts, records.into_iter())?
        }
        TableFormat::Plain => {
            plain::write_data(&mut writer, &mut collector, opts, records.into_iter())?
        }
    };
    if collector.props.num_entries == 0 {
        drop(writer);
        let _ = fs::remove_file(&tmp_path);
        return Err(TableError::Internal("refusing to build an empty table".into()));
    }

    let filter = collector.write_filter(&mut writer, opts.filter_policy)?;
    let index = writer.write_block(&index, CompressionType::None)?;
    let properties = collector.finish();
    let props_handle = writer.write_block(&encoding::encode_to_vec(&properties)?, CompressionType::None)?;

    let file_size = writer.finish(&Footer {
        format: opts.format,
        filter,
        index,
        properties: props_handle,
    })?;

    fs::rename(&tmp_path, path)?;
    if let Some(dir) = path.parent() {
        File::open(dir)?.sync_all()?;
    }

    debug!(
        path = %path.display(),
        format = opts.format.factory_name(),
        entries = properties.num_entries,
        file_size,
        "table built"
    );

    Ok(BuiltTable {
        path: path.to_path_buf(),
        file_size,
        properties,
    })
}

// ------------------------------------------------------------------------------------------------
// Reading
// ------------------------------------------------------------------------------------------------

/// Shared services handed to every table reader.
#[derive(Clone)]
pub struct TableReadContext {
    pub cache: Option<Arc<BlockCache>>,
    pub stats: Arc<Statistics>,
}

/// Outcome of a point lookup against one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableLookup {
    /// The filter ruled the key out; no data was read.
    Filtered,
    /// Data was read but the key is not in this table.
    Absent,
    /// Newest version of the key in this table (possibly a tombstone).
    Found(Record),
}

/// An open table of either format.
pub enum Table {
    BlockBased(Arc<BlockBasedTable>),
    Plain(Arc<PlainTable>),
}

/// Filter check shared by both formats.
pub(crate) fn filter_may_match(filter: Option<&KeyFilter>, key: &[u8]) -> bool {
    filter.is_none_or(|filter| filter.may_match(key))
}

/// A live table plus the bookkeeping the engine keeps about it.
///
/// Once marked obsolete (replaced by compaction), the file is removed when
/// the last holder of the handle (a version, an iterator, a compaction)
/// drops it.
pub struct TableHandle {
    id: u64,
    path: PathBuf,
    file_size: u64,
    table: Table,
    allowed_seeks: AtomicI64,
    being_compacted: AtomicBool,
    obsolete: AtomicBool,
    cache: Option<Arc<BlockCache>>,
}

impl std::fmt::Debug for TableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableHandle")
            .field("id", &self.id)
            .field("file_size", &self.file_size)
            .finish_non_exhaustive()
    }
}

impl TableHandle {
    /// Memory-map and validate table `id` at `path`.
    pub fn open(id: u64, path: &Path, ctx: &TableReadContext) -> Result<Self, TableError> {
        let file = File::open(path)?;
        // SAFETY: table files are immutable once renamed into place and are
        // only removed after every handle to them is gone.
        let mmap = unsafe { Mmap::map(&file)? };
        let file_size = mmap.len() as u64;

        let footer = Footer::decode(&mmap)?;
        let properties = {
            let raw = read_block(&mmap, footer.properties)?;
            TableProperties::decode_from(&raw)?.0
        };
        if properties.format != footer.format {
            return Err(TableError::Corruption(
                "footer and properties disagree on format".into(),
            ));
        }
        let filter = match footer.filter {
            Some(handle) => Some(
                KeyFilter::decode(&read_block(&mmap, handle)?)
                    .map_err(|e| TableError::Corruption(e.to_string()))?,
            ),
            None => None,
        };

        let table = match footer.format {
            TableFormat::BlockBased => Table::BlockBased(Arc::new(BlockBasedTable::open(
                id, mmap, &footer, properties, filter, ctx,
            )?)),
            TableFormat::Plain => Table::Plain(Arc::new(PlainTable::open(
                mmap, &footer, properties, filter, ctx,
            )?)),
        };

        let allowed_seeks = i64::try_from(file_size / BYTES_PER_SEEK)
            .unwrap_or(i64::MAX)
            .max(MIN_ALLOWED_SEEKS);

        info!(id, path = %path.display(), file_size, "table opened");

        Ok(Self {
            id,
            path: path.to_path_buf(),
            file_size,
            table,
            allowed_seeks: AtomicI64::new(allowed_seeks),
            being_compacted: AtomicBool::new(false),
            obsolete: AtomicBool::new(false),
            cache: ctx.cache.clone(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn properties(&self) -> &TableProperties {
        match &self.table {
            Table::BlockBased(t) => t.properties(),
            Table::Plain(t) => t.properties(),
        }
    }

    /// Filter check only.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        match &self.table {
            Table::BlockBased(t) => t.may_contain(key),
            Table::Plain(t) => t.may_contain(key),
        }
    }

    /// Newest version of `key` in this table.
    pub fn get(&self, key: &[u8], fill_cache: bool) -> Result<TableLookup, TableError> {
        if !self.may_contain(key) {
            self.stats().record_tick(Ticker::BloomFilterUseful, 1);
            return Ok(TableLookup::Filtered);
        }
        let found = match &self.table {
            Table::BlockBased(t) => t.get(key, fill_cache)?,
            Table::Plain(t) => t.get(key)?,
        };
        Ok(found.map_or(TableLookup::Absent, TableLookup::Found))
    }

    /// Bidirectional cursor over every record. Keeps this handle alive.
    pub fn cursor(self: &Arc<Self>, fill_cache: bool) -> Box<dyn RecordCursor> {
        match &self.table {
            Table::BlockBased(t) => Box::new(block_based::BlockBasedCursor::new(
                Arc::clone(t),
                Arc::clone(self),
                fill_cache,
            )),
            Table::Plain(t) => Box::new(plain::PlainCursor::new(Arc::clone(t), Arc::clone(self))),
        }
    }

    fn stats(&self) -> &Statistics {
        match &self.table {
            Table::BlockBased(t) => t.stats(),
            Table::Plain(t) => t.stats(),
        }
    }

    /// Charge one wasted seek; returns `true` exactly once, when the
    /// allowance runs out.
    pub fn charge_seek(&self) -> bool {
        self.allowed_seeks.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Claim the table for a compaction; `false` if another job holds it.
    pub fn try_claim(&self) -> bool {
        self.being_compacted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.being_compacted.store(false, Ordering::Release);
    }

    pub fn is_being_compacted(&self) -> bool {
        self.being_compacted.load(Ordering::Acquire)
    }

    /// Schedule the file for deletion once the last reference is gone.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }
}

impl Drop for TableHandle {
    fn drop(&mut self) {
        if !self.obsolete.load(Ordering::Acquire) {
            return;
        }
        if let Some(cache) = &self.cache {
            let id = self.id;
            cache.retain(|(table_id, _)| *table_id != id);
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(id = self.id, path = %self.path.display(), "removed obsolete table"),
            Err(e) => warn!(id = self.id, %e, "failed to remove obsolete table file"),
        }
    }
}
