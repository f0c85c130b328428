//! Plain table: one contiguous run of records addressed through a dense
//! offset index, read directly from the memory map without block decoding.
//!
//! With a fixed prefix length, a prefix index maps each distinct key prefix
//! to its run of record ordinals so point lookups only binary-search that
//! run.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::ops::Range;
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
use crate::options::CompressionType;
use crate::record::{MAX_SEQUENCE, Record, RecordRef, SequenceNumber, cmp_internal};
use crate::statistics::Statistics;

fn prefix_of(key: &[u8], prefix_len: usize) -> &[u8] {
    &key[..key.len().min(prefix_len)]
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PrefixEntry {
    prefix: Vec<u8>,
    first: u64,
    count: u64,
}

impl Encode for PrefixEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.prefix.encode_to(buf)?;
        self.first.encode_to(buf)?;
        self.count.encode_to(buf)
    }
}

impl Decode for PrefixEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (prefix, mut offset) = Vec::<u8>::decode_from(buf)?;
        let (first, used) = u64::decode_from(&buf[offset..])?;
        offset += used;
        let (count, used) = u64::decode_from(&buf[offset..])?;
        offset += used;
        Ok((
            Self {
                prefix,
                first,
                count,
            },
            offset,
        ))
    }
}

/// Write the data run; returns the encoded index payload
/// `[data handle][offsets][prefix entries]`.
pub(super) fn write_data(
    writer: &mut TableWriter,
    collector: &mut PropertiesCollector,
    opts: &TableBuildOptions,
    records: impl Iterator<Item = Record>,
) -> Result<Vec<u8>, TableError> {
    let mut data = Vec::new();
    let mut offsets: Vec<u64> = Vec::new();
    let mut prefixes: Vec<PrefixEntry> = Vec::new();

    for record in records {
        let ordinal = offsets.len() as u64;
        offsets.push(data.len() as u64);
        if let Some(prefix_len) = opts.prefix_len {
            let prefix = prefix_of(&record.key, prefix_len);
            match prefixes.last_mut() {
                Some(entry) if entry.prefix == prefix => entry.count += 1,
                _ => prefixes.push(PrefixEntry {
                    prefix: prefix.to_vec(),
                    first: ordinal,
                    count: 1,
                }),
            }
        }
        collector.add(&record);
        record.encode_to(&mut data)?;
    }

    let data_handle = if offsets.is_empty() {
        BlockHandle::default()
    } else {
        writer.write_block(&data, CompressionType::None)?
    };
    collector.props.num_data_blocks = u64::from(!offsets.is_empty());
    collector.props.prefix_len = opts
        .prefix_len
        .map_or(0, |len| u32::try_from(len).unwrap_or(u32::MAX));

    let mut payload = Vec::new();
    data_handle.encode_to(&mut payload)?;
    encoding::encode_vec(&offsets, &mut payload)?;
    encoding::encode_vec(&prefixes, &mut payload)?;
    Ok(payload)
}

pub struct PlainTable {
    mmap: Mmap,
    data: Range<usize>,
    offsets: Vec<u64>,
    prefix_index: Option<HashMap<Vec<u8>, Range<usize>>>,
    filter: Option<KeyFilter>,
    properties: TableProperties,
    stats: Arc<Statistics>,
}

impl PlainTable {
    pub(super) fn open(
        mmap: Mmap,
        footer: &Footer,
        properties: TableProperties,
        filter: Option<KeyFilter>,
        ctx: &TableReadContext,
    ) -> Result<Self, TableError> {
        let (data_handle, offsets, prefixes) = {
            let raw = read_block(&mmap, footer.index)?;
            let (data_handle, mut offset) = BlockHandle::decode_from(&raw)?;
            let (offsets, used) = encoding::decode_vec::<u64>(&raw[offset..])?;
            offset += used;
            let (prefixes, _) = encoding::decode_vec::<PrefixEntry>(&raw[offset..])?;
            (data_handle, offsets, prefixes)
        };

        // Verifies the checksum of the whole run once, up front.
        let data_len = read_block(&mmap, data_handle)?.len();
        let start = data_handle.offset as usize;
        if offsets.iter().any(|&o| o as usize >= data_len) {
            return Err(TableError::Corruption("record offset beyond data".into()));
        }
        if offsets.len() as u64 != properties.num_entries {
            return Err(TableError::Corruption(format!(
                "offset index has {} entries, properties claim {}",
                offsets.len(),
                properties.num_entries
            )));
        }

        let prefix_index = (properties.prefix_len > 0).then(|| {
            prefixes
                .into_iter()
                .map(|e| {
                    let first = e.first as usize;
                    (e.prefix, first..first + e.count as usize)
                })
                .collect()
        });

        Ok(Self {
            mmap,
            data: start..start + data_len,
            offsets,
            prefix_index,
            filter,
            properties,
            stats: Arc::clone(&ctx.stats),
        })
    }

    pub fn properties(&self) -> &TableProperties {
        &self.properties
    }

    pub(super) fn stats(&self) -> &Statistics {
        &self.stats
    }

    fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn may_contain(&self, key: &[u8]) -> bool {
        filter_may_match(self.filter.as_ref(), key)
    }

    /// Decode record `ordinal` straight out of the map.
    fn record_at(&self, ordinal: usize) -> Result<RecordRef<'_>, TableError> {
        let offset = *self
            .offsets
            .get(ordinal)
            .ok_or_else(|| TableError::Internal(format!("ordinal {ordinal} out of range")))?;
        let data = &self.mmap[self.data.clone()];
        Ok(RecordRef::decode(&data[offset as usize..])?.0)
    }

    /// First ordinal in `range` whose record is `>= (key, seq)`.
    fn lower_bound(
        &self,
        range: Range<usize>,
        key: &[u8],
        seq: SequenceNumber,
    ) -> Result<usize, TableError> {
        let (mut lo, mut hi) = (range.start, range.end);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let record = self.record_at(mid)?;
            if cmp_internal(record.key, record.seq, key, seq) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Newest version of `key`, ignoring the filter.
    pub fn get(&self, key: &[u8]) -> Result<Option<Record>, TableError> {
        let range = match &self.prefix_index {
            Some(index) => {
                let prefix = prefix_of(key, self.properties.prefix_len as usize);
                match index.get(prefix) {
                    Some(range) => range.clone(),
                    None => return Ok(None),
                }
            }
            None => 0..self.offsets.len(),
        };
        let end = range.end;
        let pos = self.lower_bound(range, key, MAX_SEQUENCE)?;
        if pos >= end {
            return Ok(None);
        }
        let record = self.record_at(pos)?;
        Ok((record.key == key).then(|| record.to_record()))
    }
}

pub(super) struct PlainCursor {
    table: Arc<PlainTable>,
    _handle: Arc<TableHandle>,
    pos: Option<usize>,
    error: Option<EngineError>,
}

impl PlainCursor {
    pub(super) fn new(table: Arc<PlainTable>, handle: Arc<TableHandle>) -> Self {
        Self {
            table,
            _handle: handle,
            pos: None,
            error: None,
        }
    }

    fn place(&mut self, pos: usize) {
        self.pos = None;
        if pos >= self.table.len() {
            return;
        }
        match self.table.record_at(pos) {
            Ok(_) => self.pos = Some(pos),
            Err(e) => self.error = Some(e.into()),
        }
    }
}

impl RecordCursor for PlainCursor {
    fn current(&self) -> Option<RecordRef<'_>> {
        self.pos.and_then(|pos| self.table.record_at(pos).ok())
    }

    fn seek_to_first(&mut self) {
        self.place(0);
    }

    fn seek_to_last(&mut self) {
        match self.table.len() {
            0 => self.pos = None,
            n => self.place(n - 1),
        }
    }

    fn seek(&mut self, key: &[u8], seq: SequenceNumber) {
        match self.table.lower_bound(0..self.table.len(), key, seq) {
            Ok(pos) => self.place(pos),
            Err(e) => {
                self.pos = None;
                self.error = Some(e.into());
            }
        }
    }

    fn next(&mut self) {
        if let Some(pos) = self.pos {
            self.place(pos + 1);
        }
    }

    fn prev(&mut self) {
        match self.pos {
            Some(0) => self.pos = None,
            Some(pos) => self.place(pos - 1),
            None => {}
        }
    }

    fn status(&self) -> Option<&EngineError> {
        self.error.as_ref()
    }
}
