//! Byte-stable binary encoding for every persistent structure.
//!
//! WAL records, manifest events and snapshots, table blocks, indexes and
//! footers are all written through the [`Encode`] / [`Decode`] pair defined
//! here, so the on-disk format is owned by this crate and never shifts with
//! a dependency upgrade.
//!
//! # Wire format
//!
//! | Rust type   | Encoding                                   |
//! |-------------|--------------------------------------------|
//! | `u8`        | 1 byte                                     |
//! | `u32`       | 4 bytes, little-endian                     |
//! | `u64`       | 8 bytes, little-endian                     |
//! | `bool`      | 1 byte (`0x00` / `0x01`)                   |
//! | `Vec<u8>`   | `[u32 len][bytes]`                         |
//! | `Option<T>` | `[u8 tag: 0 = None, 1 = Some][T if Some]`  |
//! | `Vec<T>`    | `[u32 count][T₁][T₂]…` via [`encode_vec`]  |
//!
//! Decoders enforce [`MAX_BYTE_LEN`] and [`MAX_VEC_ELEMENTS`] so that a
//! corrupted length prefix fails fast instead of allocating gigabytes.


use thiserror::Error;

/// Upper bound for a single decoded byte string (256 MiB).
pub const MAX_BYTE_LEN: u32 = 256 * 1024 * 1024;

/// Upper bound for the element count of a decoded `Vec<T>`.
pub const MAX_VEC_ELEMENTS: u32 = 16 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced during encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof { needed: usize, available: usize },

    /// An enum discriminant was not recognised.
    #[error("invalid tag {tag} for {type_name}")]
    InvalidTag { tag: u32, type_name: &'static str },

    /// A bool field held something other than `0x00` / `0x01`.
    #[error("invalid bool byte: 0x{0:02X}")]
    InvalidBool(u8),

    /// A length or count exceeded its limit.
    #[error("length overflow: {0}")]
    LengthOverflow(String),
}

// ------------------------------------------------------------------------------------------------
// Core traits
// ------------------------------------------------------------------------------------------------

/// Serialize `self` by appending to `buf`. Output must be deterministic.
pub trait Encode {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize one value from the front of `buf`, returning it together
/// with the number of bytes consumed.
pub trait Decode: Sized {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

/// Encode a value into a freshly allocated buffer.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Encode a slice of values as `[u32 count][items…]`.
pub fn encode_vec<T: Encode>(items: &[T], buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    len_to_u32(items.len())?.encode_to(buf)?;
    for item in items {
        item.encode_to(buf)?;
    }
    Ok(())
}

/// Decode a `[u32 count][items…]` sequence.
pub fn decode_vec<T: Decode>(buf: &[u8]) -> Result<(Vec<T>, usize), EncodingError> {
    let (count, mut offset) = u32::decode_from(buf)?;
    if count > MAX_VEC_ELEMENTS {
        return Err(EncodingError::LengthOverflow(format!(
            "vec count {count} exceeds limit {MAX_VEC_ELEMENTS}"
        )));
    }
    // Each element takes at least one byte, so a count beyond the remaining
    // buffer is already known to be bogus.
    let remaining = buf.len() - offset;
    let mut items = Vec::with_capacity((count as usize).min(remaining));
    for _ in 0..count {
        let (item, used) = T::decode_from(&buf[offset..])?;
        offset += used;
        items.push(item);
    }
    Ok((items, offset))
}

// ------------------------------------------------------------------------------------------------
// Internal helpers
// ------------------------------------------------------------------------------------------------

#[inline]
fn require(buf: &[u8], needed: usize) -> Result<(), EncodingError> {
    if buf.len() < needed {
        return Err(EncodingError::UnexpectedEof {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

#[inline]
pub(crate) fn len_to_u32(len: usize) -> Result<u32, EncodingError> {
    u32::try_from(len)
        .map_err(|_| EncodingError::LengthOverflow(format!("length {len} exceeds u32::MAX")))
}

// ------------------------------------------------------------------------------------------------
// Primitive implementations
// ------------------------------------------------------------------------------------------------

impl Encode for u8 {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(*self);
        Ok(())
    }
}

impl Decode for u8 {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        Ok((buf[0], 1))
    }
}

impl Encode for u32 {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u32 {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&buf[..4]);
        Ok((u32::from_le_bytes(raw), 4))
    }
}

impl Encode for u64 {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u64 {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[..8]);
        Ok((u64::from_le_bytes(raw), 8))
    }
}

impl Encode for bool {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(u8::from(*self));
        Ok(())
    }
}

impl Decode for bool {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        match buf[0] {
            0 => Ok((false, 1)),
            1 => Ok((true, 1)),
            other => Err(EncodingError::InvalidBool(other)),
        }
    }
}

impl Encode for [u8] {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        len_to_u32(self.len())?.encode_to(buf)?;
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl Encode for Vec<u8> {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_slice().encode_to(buf)
    }
}

impl Decode for Vec<u8> {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (bytes, used) = decode_bytes(buf)?;
        Ok((bytes.to_vec(), used))
    }
}

/// Borrow a length-prefixed byte string without copying it.
pub fn decode_bytes(buf: &[u8]) -> Result<(&[u8], usize), EncodingError> {
    let (len, _) = u32::decode_from(buf)?;
    if len > MAX_BYTE_LEN {
        return Err(EncodingError::LengthOverflow(format!(
            "byte length {len} exceeds limit {MAX_BYTE_LEN}"
        )));
    }
    let end = 4 + len as usize;
    require(buf, end)?;
    Ok((&buf[4..end], end))
}

impl<T: Encode> Encode for Option<T> {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            None => 0u8.encode_to(buf),
            Some(inner) => {
                1u8.encode_to(buf)?;
                inner.encode_to(buf)
            }
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, _) = u8::decode_from(buf)?;
        match tag {
            0 => Ok((None, 1)),
            1 => {
                let (inner, used) = T::decode_from(&buf[1..])?;
                Ok((Some(inner), 1 + used))
            }
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "Option",
            }),
        }
    }
}
