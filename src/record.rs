//! The versioned record shared by memtables, WAL segments and tables.
//!
//! Records are ordered by **key ascending, sequence number descending**, so
//! the newest version of a key always sorts first among its versions. This
//! single ordering drives memtable layout, table layout, merge iteration and
//! compaction.
//!
//! Wire layout: `[seq u64][kind u8][key: u32 len + bytes][value: u32 len + bytes, Put only]`.

use std::cmp::Ordering;

use crate::encoding::{self, Decode, Encode, EncodingError};

/// Monotonic write-order counter.
pub type SequenceNumber = u64;

/// Highest representable sequence number; seeking with it lands on the
/// newest version of a key.
pub const MAX_SEQUENCE: SequenceNumber = u64::MAX;

const KIND_DELETE: u8 = 0;
const KIND_PUT: u8 = 1;

/// Compare two `(key, seq)` pairs in internal order.
#[inline]
pub fn cmp_internal(a_key: &[u8], a_seq: u64, b_key: &[u8], b_seq: u64) -> Ordering {
    a_key.cmp(b_key).then_with(|| b_seq.cmp(&a_seq))
}

/// A single versioned mutation. `value == None` marks a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub seq: SequenceNumber,
    pub value: Option<Vec<u8>>,
}

impl Record {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, seq: SequenceNumber) -> Self {
        Self {
            key: key.into(),
            seq,
            value: Some(value.into()),
        }
    }

    pub fn tombstone(key: impl Into<Vec<u8>>, seq: SequenceNumber) -> Self {
        Self {
            key: key.into(),
            seq,
            value: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Bytes charged against a write buffer or block budget.
    pub fn charge(&self) -> usize {
        // key + value + seq + kind + two length prefixes
        self.key.len() + self.value.as_ref().map_or(0, Vec::len) + 17
    }

    pub fn view(&self) -> RecordRef<'_> {
        RecordRef {
            key: &self.key,
            seq: self.seq,
            value: self.value.as_deref(),
        }
    }
}

impl Ord for Record {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_internal(&self.key, self.seq, &other.key, other.seq)
    }
}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Zero-copy view of an encoded record, used when reading straight out of
/// a memory-mapped table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRef<'a> {
    pub key: &'a [u8],
    pub seq: SequenceNumber,
    pub value: Option<&'a [u8]>,
}

impl<'a> RecordRef<'a> {
    /// Decode one record from the front of `buf` without copying.
    pub fn decode(buf: &'a [u8]) -> Result<(Self, usize), EncodingError> {
        let (seq, mut offset) = u64::decode_from(buf)?;
        let (kind, used) = u8::decode_from(&buf[offset..])?;
        offset += used;
        let (key, used) = encoding::decode_bytes(&buf[offset..])?;
        offset += used;
        let value = match kind {
            KIND_PUT => {
                let (value, used) = encoding::decode_bytes(&buf[offset..])?;
                offset += used;
                Some(value)
            }
            KIND_DELETE => None,
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: u32::from(other),
                    type_name: "Record",
                });
            }
        };
        Ok((Self { key, seq, value }, offset))
    }

    pub fn to_record(self) -> Record {
        Record {
            key: self.key.to_vec(),
            seq: self.seq,
            value: self.value.map(<[u8]>::to_vec),
        }
    }
}

impl Encode for RecordRef<'_> {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.seq.encode_to(buf)?;
        match self.value {
            Some(value) => {
                KIND_PUT.encode_to(buf)?;
                self.key.encode_to(buf)?;
                value.encode_to(buf)
            }
            None => {
                KIND_DELETE.encode_to(buf)?;
                self.key.encode_to(buf)
            }
        }
    }
}

impl Encode for Record {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.view().encode_to(buf)
    }
}

impl Decode for Record {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (view, used) = RecordRef::decode(buf)?;
        Ok((view.to_record(), used))
    }
}

/// Hex rendering of a key for log fields.
pub(crate) struct HexKey<'a>(pub &'a [u8]);

impl std::fmt::Display for HexKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0.iter().take(32) {
            write!(f, "{byte:02x}")?;
        }
        if self.0.len() > 32 {
            write!(f, "..")?;
        }
        Ok(())
    }
}
