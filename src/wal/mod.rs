//! Write-ahead log.
//!
//! A durable, append-only, generic log used for two things: every memtable
//! owns one segment holding the records it has not yet flushed, and the
//! manifest keeps its event log in one.
//!
//! # On-disk layout
//!
//! ```text
//! [HEADER_BYTES][HEADER_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! ...
//! ```
//!
//! - **Header**: [`WalHeader`] encoded with the crate encoding, then a CRC32.
//! - **Record**: 4-byte length, encoded record, CRC32 over `len || bytes`.
//!
//! # Durability
//!
//! [`Wal::append`] always hands the bytes to the operating system. When the
//! caller asks for `sync`, the file is fsynced before returning, which is the
//! only point at which a record survives a machine crash.
//!
//! # Replay
//!
//! [`WalIter`] yields records until end-of-file. A record cut short by a
//! crash surfaces as [`WalError::UnexpectedEof`] and a damaged one as
//! [`WalError::ChecksumMismatch`]; the caller decides how strict to be.

#[cfg(test)]
mod tests;

use std::{
    ffi::OsStr,
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, error, trace};

use crate::encoding::{self, Decode, Encode, EncodingError};

const U32_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Stored checksum does not match the record bytes.
    #[error("Checksum mismatch at offset {0}")]
    ChecksumMismatch(u64),

    #[error("Record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// The log ends in the middle of a record.
    #[error("Unexpected end of file at offset {0}")]
    UnexpectedEof(u64),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

/// Metadata written at the start of every segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub max_record_size: u32,
    /// Segment id; must match the number in the file name.
    pub wal_id: u64,
}

impl WalHeader {
    pub const MAGIC: [u8; 4] = *b"SWAL";
    pub const VERSION: u32 = 1;
    pub const DEFAULT_MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;
    /// magic + version + max_record_size + wal_id
    pub const ENCODED_LEN: usize = 4 + 4 + 4 + 8;

    pub fn new(max_record_size: u32, wal_id: u64) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            max_record_size,
            wal_id,
        }
    }
}

impl Encode for WalHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.magic);
        self.version.encode_to(buf)?;
        self.max_record_size.encode_to(buf)?;
        self.wal_id.encode_to(buf)
    }
}

impl Decode for WalHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(EncodingError::UnexpectedEof {
                needed: Self::ENCODED_LEN,
                available: buf.len(),
            });
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[..4]);
        let (version, _) = u32::decode_from(&buf[4..])?;
        let (max_record_size, _) = u32::decode_from(&buf[8..])?;
        let (wal_id, _) = u64::decode_from(&buf[12..])?;
        Ok((
            Self {
                magic,
                version,
                max_record_size,
                wal_id,
            },
            Self::ENCODED_LEN,
        ))
    }
}

/// Record types storable in a [`Wal`].
pub trait WalData: Encode + Decode + std::fmt::Debug + Send + Sync {}
impl<T> WalData for T where T: Encode + Decode + std::fmt::Debug + Send + Sync {}

/// File name of segment `id`.
pub fn segment_file_name(id: u64) -> String {
    format!("{id:06}.log")
}

/// Parse a segment id out of a `NNNNNN.log` file name.
pub fn parse_segment_id(path: &Path) -> Option<u64> {
    let name = path.file_name().and_then(OsStr::to_str)?;
    name.strip_suffix(".log")?.parse::<u64>().ok()
}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

/// A generic, thread-safe write-ahead log segment.
#[derive(Debug)]
pub struct Wal<T: WalData> {
    file: Arc<Mutex<File>>,
    path: PathBuf,
    header: WalHeader,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: WalData> Wal<T> {
    /// Open or create the segment at `path`. Its file name must be
    /// `NNNNNN.log`, matching the header's id when the file already exists.
    pub fn open(path: impl AsRef<Path>, max_record_size: Option<u32>) -> Result<Self, WalError> {
        let path = path.as_ref();
        let wal_id = parse_segment_id(path)
            .ok_or_else(|| WalError::Internal(format!("bad WAL file name {}", path.display())))?;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let header = if file.metadata()?.len() == 0 {
            let header = WalHeader::new(
                max_record_size.unwrap_or(WalHeader::DEFAULT_MAX_RECORD_SIZE),
                wal_id,
            );
            write_header(&mut file, &header)?;
            debug!(wal_id, path = %path.display(), "created WAL segment");
            header
        } else {
            let header = read_header(&mut file)?;
            if header.wal_id != wal_id {
                return Err(WalError::InvalidHeader(format!(
                    "segment id {} does not match file name id {wal_id}",
                    header.wal_id
                )));
            }
            debug!(wal_id, path = %path.display(), "opened existing WAL segment");
            header
        };

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            path: path.to_path_buf(),
            header,
            _phantom: std::marker::PhantomData,
        })
    }

    /// Append one record; returns the number of bytes written including
    /// framing. With `sync` the segment is fsynced before returning.
    pub fn append(&self, record: &T, sync: bool) -> Result<usize, WalError> {
        let bytes = encoding::encode_to_vec(record)?;
        if bytes.len() > self.header.max_record_size as usize {
            return Err(WalError::RecordTooLarge(bytes.len()));
        }
        let len = encoding::len_to_u32(bytes.len())?.to_le_bytes();

        let mut hasher = Crc32::new();
        hasher.update(&len);
        hasher.update(&bytes);
        let checksum = hasher.finalize();

        let mut frame = Vec::with_capacity(bytes.len() + 2 * U32_SIZE);
        frame.extend_from_slice(&len);
        frame.extend_from_slice(&bytes);
        frame.extend_from_slice(&checksum.to_le_bytes());

        let mut guard = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;
        guard.write_all(&frame)?;
        if sync {
            guard.sync_data()?;
        }

        trace!(wal_id = self.header.wal_id, len = frame.len(), sync, "appended WAL record");
        Ok(frame.len())
    }

    /// Iterate over every record in the segment from the start.
    pub fn replay_iter(&self) -> WalIter<T> {
        WalIter {
            file: Arc::clone(&self.file),
            offset: (WalHeader::ENCODED_LEN + U32_SIZE) as u64,
            max_record_size: self.header.max_record_size as usize,
            done: false,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Drop every record, leaving only the header.
    pub fn truncate(&self) -> Result<(), WalError> {
        let mut guard = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;
        guard.set_len(0)?;
        guard.seek(SeekFrom::Start(0))?;
        write_header(&mut guard, &self.header)?;
        debug!(wal_id = self.header.wal_id, "truncated WAL segment");
        Ok(())
    }

    /// Cut the segment back to `len` bytes, discarding a damaged tail so
    /// that later appends are not hidden behind it on the next replay.
    pub fn truncate_to(&self, len: u64) -> Result<(), WalError> {
        let guard = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;
        let header_end = (WalHeader::ENCODED_LEN + U32_SIZE) as u64;
        guard.set_len(len.max(header_end))?;
        guard.sync_all()?;
        debug!(wal_id = self.header.wal_id, len, "cut WAL segment tail");
        Ok(())
    }

    /// Fsync the segment.
    pub fn sync(&self) -> Result<(), WalError> {
        let guard = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;
        guard.sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T: WalData> Drop for Wal<T> {
    fn drop(&mut self) {
        let guard = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = guard.sync_all() {
            error!(path = %self.path.display(), %e, "failed to sync WAL on drop");
        }
    }
}

fn write_header(file: &mut File, header: &WalHeader) -> Result<(), WalError> {
    let bytes = encoding::encode_to_vec(header)?;
    let checksum = crc32fast::hash(&bytes);
    file.write_all(&bytes)?;
    file.write_all(&checksum.to_le_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn read_header(file: &mut File) -> Result<WalHeader, WalError> {
    file.seek(SeekFrom::Start(0))?;
    let mut raw = [0u8; WalHeader::ENCODED_LEN + U32_SIZE];
    file.read_exact(&mut raw).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => WalError::InvalidHeader("header truncated".into()),
        _ => WalError::Io(e),
    })?;

    let (bytes, stored) = raw.split_at(WalHeader::ENCODED_LEN);
    let mut crc = [0u8; U32_SIZE];
    crc.copy_from_slice(stored);
    if crc32fast::hash(bytes) != u32::from_le_bytes(crc) {
        return Err(WalError::InvalidHeader("header checksum mismatch".into()));
    }

    let (header, _) = WalHeader::decode_from(bytes)?;
    if header.magic != WalHeader::MAGIC {
        return Err(WalError::InvalidHeader("bad magic".into()));
    }
    if header.version != WalHeader::VERSION {
        return Err(WalError::InvalidHeader(format!(
            "unsupported version {}",
            header.version
        )));
    }
    Ok(header)
}

// ------------------------------------------------------------------------------------------------
// WalIter
// ------------------------------------------------------------------------------------------------

/// Streaming replay iterator. Stops after the first error.
pub struct WalIter<T: WalData> {
    file: Arc<Mutex<File>>,
    offset: u64,
    max_record_size: usize,
    done: bool,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: WalData> WalIter<T> {
    /// Offset just past the last record successfully read.
    pub fn position(&self) -> u64 {
        self.offset
    }

    fn read_next(&mut self) -> Result<Option<T>, WalError> {
        let mut guard = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;
        guard.seek(SeekFrom::Start(self.offset))?;

        let mut len_bytes = [0u8; U32_SIZE];
        match read_fully(&mut guard, &mut len_bytes)? {
            0 => return Ok(None),
            n if n < U32_SIZE => return Err(WalError::UnexpectedEof(self.offset)),
            _ => {}
        }

        let record_len = u32::from_le_bytes(len_bytes) as usize;
        if record_len > self.max_record_size {
            return Err(WalError::RecordTooLarge(record_len));
        }

        let mut body = vec![0u8; record_len + U32_SIZE];
        if read_fully(&mut guard, &mut body)? < body.len() {
            return Err(WalError::UnexpectedEof(self.offset));
        }
        let (bytes, stored) = body.split_at(record_len);

        let mut hasher = Crc32::new();
        hasher.update(&len_bytes);
        hasher.update(bytes);
        let mut crc = [0u8; U32_SIZE];
        crc.copy_from_slice(stored);
        if hasher.finalize() != u32::from_le_bytes(crc) {
            return Err(WalError::ChecksumMismatch(self.offset));
        }

        let (record, _) = T::decode_from(bytes)?;
        self.offset += (record_len + 2 * U32_SIZE) as u64;
        Ok(Some(record))
    }
}

impl<T: WalData> Iterator for WalIter<T> {
    type Item = Result<T, WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_next() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
fn read_fully(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
