//! # Manifest
//!
//! Durable metadata of the database: which WAL segment is active, which
//! frozen segments still await a flush, the live tables in recency order,
//! the last committed sequence number and the file number allocator.
//!
//! ## Persistence
//!
//! The manifest is a small WAL-backed database of its own:
//!
//! 1. Every mutation is appended to the manifest log (`000000.log`, one
//!    non-rotating segment) as a [`ManifestEvent`] before it is applied in
//!    memory.
//! 2. [`Manifest::checkpoint`] writes the whole state to `MANIFEST`
//!    (temp file, fsync, rename, directory fsync) and then truncates the log.
//! 3. On open the snapshot is loaded, its checksum verified, and the log
//!    replayed on top. A torn log tail is cut off; a bad snapshot checksum
//!    is corruption.


use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::record::SequenceNumber;
use crate::wal::{Wal, WalError};

const SNAPSHOT_FILENAME: &str = "MANIFEST";
const SNAPSHOT_TMP_FILENAME: &str = "MANIFEST.tmp";
const SNAPSHOT_MAGIC: [u8; 4] = *b"SMAN";
const LOG_FILENAME: &str = "000000.log";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Snapshot corrupted: {0}")]
    SnapshotCorrupted(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Data
// ------------------------------------------------------------------------------------------------

/// A live table as recorded in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableMeta {
    pub id: u64,
    pub file_size: u64,
}

impl Encode for TableMeta {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        self.file_size.encode_to(buf)
    }
}

impl Decode for TableMeta {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (id, mut offset) = u64::decode_from(buf)?;
        let (file_size, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { id, file_size }, offset))
    }
}

/// Full manifest state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestData {
    pub last_sequence: SequenceNumber,
    pub next_file_number: u64,
    pub active_wal: u64,
    /// Oldest first.
    pub frozen_wals: Vec<u64>,
    /// Newest first.
    pub tables: Vec<TableMeta>,
}

impl Default for ManifestData {
    fn default() -> Self {
        Self {
            last_sequence: 0,
            // 0 names the manifest log itself.
            next_file_number: 1,
            active_wal: 0,
            frozen_wals: Vec::new(),
            tables: Vec::new(),
        }
    }
}

impl Encode for ManifestData {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.last_sequence.encode_to(buf)?;
        self.next_file_number.encode_to(buf)?;
        self.active_wal.encode_to(buf)?;
        encoding::encode_vec(&self.frozen_wals, buf)?;
        encoding::encode_vec(&self.tables, buf)
    }
}

impl Decode for ManifestData {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (last_sequence, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (next_file_number, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (active_wal, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (frozen_wals, n) = encoding::decode_vec::<u64>(&buf[offset..])?;
        offset += n;
        let (tables, n) = encoding::decode_vec::<TableMeta>(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                last_sequence,
                next_file_number,
                active_wal,
                frozen_wals,
                tables,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Events
// ------------------------------------------------------------------------------------------------

/// One logged metadata mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestEvent {
    /// File number `id` was handed out.
    AllocateFileNumber { id: u64 },

    /// `wal` becomes the active segment.
    SetActiveWal { wal: u64 },

    /// The active segment was frozen and `active` took its place.
    Rotate { active: u64 },

    /// Frozen segment `wal` was written out as `table`, the new newest
    /// table (`None` when the segment held no records).
    FlushCompleted {
        wal: u64,
        table: Option<TableMeta>,
        last_sequence: SequenceNumber,
    },

    /// An adjacent run of tables was replaced by `added` (or by nothing,
    /// when every record was dropped).
    Compaction {
        added: Option<TableMeta>,
        removed: Vec<u64>,
    },

    SetLastSequence { seq: SequenceNumber },
}

impl Encode for ManifestEvent {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            ManifestEvent::AllocateFileNumber { id } => {
                0u32.encode_to(buf)?;
                id.encode_to(buf)
            }
            ManifestEvent::SetActiveWal { wal } => {
                1u32.encode_to(buf)?;
                wal.encode_to(buf)
            }
            ManifestEvent::Rotate { active } => {
                2u32.encode_to(buf)?;
                active.encode_to(buf)
            }
            ManifestEvent::FlushCompleted {
                wal,
                table,
                last_sequence,
            } => {
                3u32.encode_to(buf)?;
                wal.encode_to(buf)?;
                table.encode_to(buf)?;
                last_sequence.encode_to(buf)
            }
            ManifestEvent::Compaction { added, removed } => {
                4u32.encode_to(buf)?;
                added.encode_to(buf)?;
                encoding::encode_vec(removed, buf)
            }
            ManifestEvent::SetLastSequence { seq } => {
                5u32.encode_to(buf)?;
                seq.encode_to(buf)
            }
        }
    }
}

impl Decode for ManifestEvent {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u32::decode_from(buf)?;
        let event = match tag {
            0 => {
                let (id, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                ManifestEvent::AllocateFileNumber { id }
            }
            1 => {
                let (wal, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                ManifestEvent::SetActiveWal { wal }
            }
            2 => {
                let (active, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                ManifestEvent::Rotate { active }
            }
            3 => {
                let (wal, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                let (table, n) = Option::<TableMeta>::decode_from(&buf[offset..])?;
                offset += n;
                let (last_sequence, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                ManifestEvent::FlushCompleted {
                    wal,
                    table,
                    last_sequence,
                }
            }
            4 => {
                let (added, n) = Option::<TableMeta>::decode_from(&buf[offset..])?;
                offset += n;
                let (removed, n) = encoding::decode_vec::<u64>(&buf[offset..])?;
                offset += n;
                ManifestEvent::Compaction { added, removed }
            }
            5 => {
                let (seq, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                ManifestEvent::SetLastSequence { seq }
            }
            _ => {
                return Err(EncodingError::InvalidTag {
                    tag,
                    type_name: "ManifestEvent",
                });
            }
        };
        Ok((event, offset))
    }
}

// ------------------------------------------------------------------------------------------------
// Manifest core
// ------------------------------------------------------------------------------------------------

/// Crash-safe metadata store. Mutations take `&self`; only
/// [`checkpoint`](Self::checkpoint) needs exclusive access.
#[derive(Debug)]
pub struct Manifest {
    dir: PathBuf,
    log: Wal<ManifestEvent>,
    data: Mutex<ManifestData>,
    events_since_checkpoint: Mutex<u64>,
}

impl Manifest {
    /// Whether `dir` holds a manifest.
    pub fn exists(dir: impl AsRef<Path>) -> bool {
        let dir = dir.as_ref();
        dir.join(SNAPSHOT_FILENAME).exists() || dir.join(LOG_FILENAME).exists()
    }

    /// Load the snapshot (if any) and replay the log over it.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let snapshot_path = dir.join(SNAPSHOT_FILENAME);
        let data = if snapshot_path.exists() {
            let data = Self::read_snapshot(&snapshot_path)?;
            debug!(path = %snapshot_path.display(), "loaded manifest snapshot");
            data
        } else {
            ManifestData::default()
        };

        let log = Wal::<ManifestEvent>::open(dir.join(LOG_FILENAME), None)?;
        let manifest = Self {
            dir,
            log,
            data: Mutex::new(data),
            events_since_checkpoint: Mutex::new(0),
        };
        manifest.replay_log()?;
        Ok(manifest)
    }

    fn lock_data(&self) -> Result<MutexGuard<'_, ManifestData>, ManifestError> {
        self.data.lock().map_err(|_| {
            error!("manifest mutex poisoned");
            ManifestError::Internal("Mutex poisoned".into())
        })
    }

    /// Copy of the current state.
    pub fn data(&self) -> Result<ManifestData, ManifestError> {
        Ok(self.lock_data()?.clone())
    }

    /// Number of events logged since the last checkpoint.
    pub fn pending_events(&self) -> u64 {
        self.events_since_checkpoint.lock().map_or(0, |n| *n)
    }

    // --------------------------------------------------------------------
    // Mutations
    // --------------------------------------------------------------------

    /// Hand out the next file number (WAL segments and tables share it).
    pub fn allocate_file_number(&self) -> Result<u64, ManifestError> {
        let mut data = self.lock_data()?;
        let id = data.next_file_number;
        let event = ManifestEvent::AllocateFileNumber { id };
        self.log_event(&event)?;
        Self::apply(&mut data, &event);
        Ok(id)
    }

    pub fn set_active_wal(&self, wal: u64) -> Result<(), ManifestError> {
        self.record(ManifestEvent::SetActiveWal { wal })
    }

    /// Freeze the active segment and make `active` the new one.
    pub fn rotate_wal(&self, active: u64) -> Result<(), ManifestError> {
        self.record(ManifestEvent::Rotate { active })
    }

    pub fn record_flush(
        &self,
        wal: u64,
        table: Option<TableMeta>,
        last_sequence: SequenceNumber,
    ) -> Result<(), ManifestError> {
        self.record(ManifestEvent::FlushCompleted {
            wal,
            table,
            last_sequence,
        })
    }

    pub fn apply_compaction(
        &self,
        added: Option<TableMeta>,
        removed: Vec<u64>,
    ) -> Result<(), ManifestError> {
        self.record(ManifestEvent::Compaction { added, removed })
    }

    pub fn set_last_sequence(&self, seq: SequenceNumber) -> Result<(), ManifestError> {
        self.record(ManifestEvent::SetLastSequence { seq })
    }

    /// Log then apply, under the data lock so log order equals apply order.
    fn record(&self, event: ManifestEvent) -> Result<(), ManifestError> {
        let mut data = self.lock_data()?;
        self.log_event(&event)?;
        Self::apply(&mut data, &event);
        Ok(())
    }

    fn log_event(&self, event: &ManifestEvent) -> Result<(), ManifestError> {
        self.log.append(event, true)?;
        if let Ok(mut n) = self.events_since_checkpoint.lock() {
            *n += 1;
        }
        Ok(())
    }

    fn apply(data: &mut ManifestData, event: &ManifestEvent) {
        match event {
            ManifestEvent::AllocateFileNumber { id } => {
                data.next_file_number = data.next_file_number.max(id + 1);
            }
            ManifestEvent::SetActiveWal { wal } => {
                data.active_wal = *wal;
                data.frozen_wals.retain(|w| w != wal);
            }
            ManifestEvent::Rotate { active } => {
                let frozen = data.active_wal;
                if !data.frozen_wals.contains(&frozen) {
                    data.frozen_wals.push(frozen);
                }
                data.active_wal = *active;
            }
            ManifestEvent::FlushCompleted {
                wal,
                table,
                last_sequence,
            } => {
                data.frozen_wals.retain(|w| w != wal);
                if let Some(table) = table {
                    if !data.tables.iter().any(|t| t.id == table.id) {
                        data.tables.insert(0, *table);
                    }
                }
                data.last_sequence = data.last_sequence.max(*last_sequence);
            }
            ManifestEvent::Compaction { added, removed } => {
                let position = data
                    .tables
                    .iter()
                    .position(|t| removed.contains(&t.id))
                    .unwrap_or(data.tables.len());
                data.tables.retain(|t| !removed.contains(&t.id));
                if let Some(added) = added {
                    if !data.tables.iter().any(|t| t.id == added.id) {
                        let position = position.min(data.tables.len());
                        data.tables.insert(position, *added);
                    }
                }
            }
            ManifestEvent::SetLastSequence { seq } => {
                data.last_sequence = data.last_sequence.max(*seq);
            }
        }
    }

    // --------------------------------------------------------------------
    // Snapshot
    // --------------------------------------------------------------------

    /// Persist the full state to `MANIFEST` and truncate the log.
    pub fn checkpoint(&mut self) -> Result<(), ManifestError> {
        let data = self.lock_data()?.clone();

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&SNAPSHOT_MAGIC);
        data.encode_to(&mut bytes)?;
        let checksum = crc32fast::hash(&bytes);
        checksum.encode_to(&mut bytes)?;

        let tmp_path = self.dir.join(SNAPSHOT_TMP_FILENAME);
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        let final_path = self.dir.join(SNAPSHOT_FILENAME);
        fs::rename(&tmp_path, &final_path)?;
        File::open(&self.dir)?.sync_all()?;

        self.log.truncate()?;
        if let Ok(mut n) = self.events_since_checkpoint.lock() {
            *n = 0;
        }

        info!(
            path = %final_path.display(),
            tables = data.tables.len(),
            last_sequence = data.last_sequence,
            "manifest checkpoint written"
        );
        Ok(())
    }

    fn read_snapshot(path: &Path) -> Result<ManifestData, ManifestError> {
        let mut buf = Vec::new();
        File::open(path)?.read_to_end(&mut buf)?;

        if buf.len() < SNAPSHOT_MAGIC.len() + 4 {
            return Err(ManifestError::SnapshotCorrupted(format!(
                "snapshot too short ({} bytes)",
                buf.len()
            )));
        }
        let (body, crc) = buf.split_at(buf.len() - 4);
        let (stored, _) = u32::decode_from(crc)?;
        if crc32fast::hash(body) != stored {
            return Err(ManifestError::SnapshotCorrupted("checksum mismatch".into()));
        }
        if body[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC {
            return Err(ManifestError::SnapshotCorrupted("bad magic".into()));
        }
        let (data, _) = ManifestData::decode_from(&body[SNAPSHOT_MAGIC.len()..])?;
        Ok(data)
    }

    fn replay_log(&self) -> Result<(), ManifestError> {
        let mut iter = self.log.replay_iter();
        let mut count = 0u64;
        let mut data = self.lock_data()?;

        #[allow(clippy::while_let_on_iterator)]
        while let Some(item) = iter.next() {
            match item {
                Ok(event) => {
                    Self::apply(&mut data, &event);
                    count += 1;
                }
                Err(e) => {
                    let valid_len = iter.position();
                    warn!(%e, valid_len, "manifest log tail unreadable; truncating");
                    self.log.truncate_to(valid_len)?;
                    break;
                }
            }
        }
        drop(data);

        if let Ok(mut n) = self.events_since_checkpoint.lock() {
            *n = count;
        }
        debug!(events = count, "manifest log replayed");
        Ok(())
    }
}
