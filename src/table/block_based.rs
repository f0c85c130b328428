//! Block-based table: checksummed, optionally compressed data blocks behind
//! a sparse index of block-starting keys.

use std::cmp::Ordering;
use std::sync::Arc;

use memmap2::Mmap;

use super::{
    BlockHandle, Footer, PropertiesCollector, TableBuildOptions, TableError, TableHandle,
    TableProperties, TableReadContext, TableWriter, filter_may_match, read_block,
};
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::engine::EngineError;
use crate::filter::KeyFilter;
use crate::iterator::RecordCursor;
use crate::record::{MAX_SEQUENCE, Record, RecordRef, SequenceNumber, cmp_internal};
use crate::statistics::{Statistics, Ticker};

/// One sparse index entry: the first record of a data block.
#[derive(Debug, Clone, PartialEq, Eq)]
struct IndexEntry {
    first_key: Vec<u8>,
    first_seq: SequenceNumber,
    handle: BlockHandle,
}

impl Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.first_key.encode_to(buf)?;
        self.first_seq.encode_to(buf)?;
        self.handle.encode_to(buf)
    }
}

impl Decode for IndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (first_key, mut offset) = Vec::<u8>::decode_from(buf)?;
        let (first_seq, used) = u64::decode_from(&buf[offset..])?;
        offset += used;
        let (handle, used) = BlockHandle::decode_from(&buf[offset..])?;
        offset += used;
        Ok((
            Self {
                first_key,
                first_seq,
                handle,
            },
            offset,
        ))
    }
}

/// A decoded data block, the unit of caching.
#[derive(Debug)]
pub struct Block {
    records: Vec<Record>,
    charge: usize,
}

impl Block {
    fn decode(payload: &[u8]) -> Result<Self, TableError> {
        let (records, _) = encoding::decode_vec::<Record>(payload)?;
        if records.is_empty() {
            return Err(TableError::Corruption("empty data block".into()));
        }
        let charge = records.iter().map(Record::charge).sum();
        Ok(Self { records, charge })
    }

    /// Index of the first record `>= (key, seq)`.
    fn lower_bound(&self, key: &[u8], seq: SequenceNumber) -> usize {
        self.records
            .partition_point(|r| cmp_internal(&r.key, r.seq, key, seq) == Ordering::Less)
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

// ------------------------------------------------------------------------------------------------
// Writing
// ------------------------------------------------------------------------------------------------

/// Stream `records` into data blocks; returns the encoded index payload.
pub(super) fn write_data(
    writer: &mut TableWriter,
    collector: &mut PropertiesCollector,
    opts: &TableBuildOptions,
    records: impl Iterator<Item = Record>,
) -> Result<Vec<u8>, TableError> {
    let mut index: Vec<IndexEntry> = Vec::new();
    let mut pending: Vec<Record> = Vec::new();
    let mut pending_bytes = 0usize;

    let mut flush_block = |pending: &mut Vec<Record>,
                           writer: &mut TableWriter|
     -> Result<(), TableError> {
        let Some(first) = pending.first() else {
            return Ok(());
        };
        let (first_key, first_seq) = (first.key.clone(), first.seq);
        let mut payload = Vec::new();
        encoding::encode_vec(pending, &mut payload)?;
        let handle = writer.write_block(&payload, opts.compression)?;
        index.push(IndexEntry {
            first_key,
            first_seq,
            handle,
        });
        pending.clear();
        Ok(())
    };

    for record in records {
        collector.add(&record);
        pending_bytes += record.charge();
        pending.push(record);
        if pending_bytes >= opts.block_size {
            flush_block(&mut pending, writer)?;
            pending_bytes = 0;
        }
    }
    flush_block(&mut pending, writer)?;

    collector.props.num_data_blocks = index.len() as u64;
    let mut payload = Vec::new();
    encoding::encode_vec(&index, &mut payload)?;
    Ok(payload)
}

// ------------------------------------------------------------------------------------------------
// Reading
// ------------------------------------------------------------------------------------------------

pub struct BlockBasedTable {
    id: u64,
    mmap: Mmap,
    index: Vec<IndexEntry>,
    filter: Option<KeyFilter>,
    properties: TableProperties,
    ctx: TableReadContext,
}

impl BlockBasedTable {
    pub(super) fn open(
        id: u64,
        mmap: Mmap,
        footer: &Footer,
        properties: TableProperties,
        filter: Option<KeyFilter>,
        ctx: &TableReadContext,
    ) -> Result<Self, TableError> {
        let (index, _) = {
            let raw = read_block(&mmap, footer.index)?;
            encoding::decode_vec::<IndexEntry>(&raw)?
        };
        if index.len() as u64 != properties.num_data_blocks {
            return Err(TableError::Corruption(format!(
                "index has {} entries, properties claim {} blocks",
                index.len(),
                properties.num_data_blocks
            )));
        }
        Ok(Self {
            id,
            mmap,
            index,
            filter,
            properties,
            ctx: ctx.clone(),
        })
    }

    pub fn properties(&self) -> &TableProperties {
        &self.properties
    }

    pub(super) fn stats(&self) -> &Statistics {
        &self.ctx.stats
    }

    pub fn num_blocks(&self) -> usize {
        self.index.len()
    }

    pub fn may_contain(&self, key: &[u8]) -> bool {
        filter_may_match(self.filter.as_ref(), key)
    }

    /// Last block whose first record is `<= (key, seq)`.
    fn block_for(&self, key: &[u8], seq: SequenceNumber) -> usize {
        self.index
            .partition_point(|e| {
                cmp_internal(&e.first_key, e.first_seq, key, seq) != Ordering::Greater
            })
            .saturating_sub(1)
    }

    /// Fetch block `idx`, going through the shared cache when there is one.
    fn read_data_block(&self, idx: usize, fill_cache: bool) -> Result<Arc<Block>, TableError> {
        let entry = self
            .index
            .get(idx)
            .ok_or_else(|| TableError::Internal(format!("block {idx} out of range")))?;
        let cache_key = (self.id, entry.handle.offset);

        if let Some(cache) = &self.ctx.cache {
            if let Some(block) = cache.get(&cache_key) {
                self.ctx.stats.record_tick(Ticker::BlockCacheHit, 1);
                return Ok(block);
            }
            self.ctx.stats.record_tick(Ticker::BlockCacheMiss, 1);
        }

        let block = Arc::new(Block::decode(&read_block(&self.mmap, entry.handle)?)?);

        if let Some(cache) = self.ctx.cache.as_ref().filter(|_| fill_cache) {
            if cache.insert(cache_key, Arc::clone(&block), block.charge) {
                self.ctx.stats.record_tick(Ticker::BlockCacheAdd, 1);
            }
        }
        Ok(block)
    }

    /// Position of the first record `>= (key, seq)` as `(block idx, block, pos)`.
    fn seek_position(
        &self,
        key: &[u8],
        seq: SequenceNumber,
        fill_cache: bool,
    ) -> Result<Option<(usize, Arc<Block>, usize)>, TableError> {
        if self.index.is_empty() {
            return Ok(None);
        }
        let idx = self.block_for(key, seq);
        let block = self.read_data_block(idx, fill_cache)?;
        let pos = block.lower_bound(key, seq);
        if pos < block.len() {
            return Ok(Some((idx, block, pos)));
        }
        if idx + 1 < self.index.len() {
            let next = self.read_data_block(idx + 1, fill_cache)?;
            return Ok(Some((idx + 1, next, 0)));
        }
        Ok(None)
    }

    /// Newest version of `key`, ignoring the filter.
    pub fn get(&self, key: &[u8], fill_cache: bool) -> Result<Option<Record>, TableError> {
        let found = self.seek_position(key, MAX_SEQUENCE, fill_cache)?;
        Ok(found.and_then(|(_, block, pos)| {
            let record = &block.records[pos];
            (record.key == key).then(|| record.clone())
        }))
    }
}

// ------------------------------------------------------------------------------------------------
// Cursor
// ------------------------------------------------------------------------------------------------

pub(super) struct BlockBasedCursor {
    table: Arc<BlockBasedTable>,
    _handle: Arc<TableHandle>,
    fill_cache: bool,
    block_idx: usize,
    block: Option<Arc<Block>>,
    pos: usize,
    error: Option<EngineError>,
}

impl BlockBasedCursor {
    pub(super) fn new(
        table: Arc<BlockBasedTable>,
        handle: Arc<TableHandle>,
        fill_cache: bool,
    ) -> Self {
        Self {
            table,
            _handle: handle,
            fill_cache,
            block_idx: 0,
            block: None,
            pos: 0,
            error: None,
        }
    }

    /// Load block `idx` and place the cursor at `pos` (or its last record).
    fn load(&mut self, idx: usize, at_end: bool) {
        self.block = None;
        if idx >= self.table.num_blocks() {
            return;
        }
        match self.table.read_data_block(idx, self.fill_cache) {
            Ok(block) => {
                self.pos = if at_end { block.len() - 1 } else { 0 };
                self.block_idx = idx;
                self.block = Some(block);
            }
            Err(e) => self.error = Some(e.into()),
        }
    }

    fn block_len(&self) -> usize {
        self.block.as_ref().map_or(0, |b| b.len())
    }
}

impl RecordCursor for BlockBasedCursor {
    fn current(&self) -> Option<RecordRef<'_>> {
        self.block
            .as_ref()
            .and_then(|b| b.records.get(self.pos))
            .map(Record::view)
    }

    fn seek_to_first(&mut self) {
        self.load(0, false);
    }

    fn seek_to_last(&mut self) {
        match self.table.num_blocks() {
            0 => self.block = None,
            n => self.load(n - 1, true),
        }
    }

    fn seek(&mut self, key: &[u8], seq: SequenceNumber) {
        self.block = None;
        match self.table.seek_position(key, seq, self.fill_cache) {
            Ok(Some((idx, block, pos))) => {
                self.block_idx = idx;
                self.block = Some(block);
                self.pos = pos;
            }
            Ok(None) => {}
            Err(e) => self.error = Some(e.into()),
        }
    }

    fn next(&mut self) {
        if self.block.is_none() {
            return;
        }
        self.pos += 1;
        if self.pos >= self.block_len() {
            self.load(self.block_idx + 1, false);
        }
    }

    fn prev(&mut self) {
        if self.block.is_none() {
            return;
        }
        if self.pos > 0 {
            self.pos -= 1;
        } else if self.block_idx == 0 {
            self.block = None;
        } else {
            self.load(self.block_idx - 1, true);
        }
    }

    fn status(&self) -> Option<&EngineError> {
        self.error.as_ref()
    }
}
