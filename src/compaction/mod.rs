//! # Compaction
//!
//! Tables form a single recency-ordered stack (newest first). Compaction
//! replaces an **adjacent run** of that stack with one merged table, so the
//! recency order between any two surviving records never changes.
//!
//! ## Picking
//!
//! In priority order:
//!
//! 1. **Size ratio** (once the table count reaches
//!    `level0_file_num_compaction_trigger`): from each idle table, grow a
//!    window over older neighbours while the next table is no larger than the
//!    window total plus `compaction_size_ratio` percent. The first window of
//!    two or more tables wins.
//! 2. **File count**: failing that, merge the longest run of idle tables.
//! 3. **Seek**: a table whose seek allowance ran out is merged with its older
//!    neighbour (or rewritten alone when it is the oldest).
//!
//! Picked tables are claimed for the lifetime of the [`CompactionPick`], so
//! concurrent jobs never share inputs.
//!
//! ## Merging
//!
//! Only the newest version of each key survives. A tombstone is dropped
//! as well when the run reaches the oldest table, since nothing older can
//! be resurrected.

#[cfg(test)]
mod tests;

use std::fs;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::engine::EngineError;
use crate::iterator::{MergingCursor, RecordCursor};
use crate::options::DbOptions;
use crate::record::Record;
use crate::table::{self, BuiltTable, TableBuildOptions, TableHandle};

/// Why a run of tables was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionReason {
    SizeRatio,
    FileCount,
    Seek,
    Manual,
}

impl CompactionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SizeRatio => "size-ratio",
            Self::FileCount => "file-count",
            Self::Seek => "seek",
            Self::Manual => "manual",
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Picking
// ------------------------------------------------------------------------------------------------

/// A claimed run of adjacent tables. Dropping it releases the claims.
#[derive(Debug)]
pub struct CompactionPick {
    inputs: Vec<Arc<TableHandle>>,
    includes_oldest: bool,
    reason: CompactionReason,
}

impl CompactionPick {
    /// Claim `tables[range]`, or nothing if any of them is already taken.
    fn claim(
        tables: &[Arc<TableHandle>],
        range: Range<usize>,
        reason: CompactionReason,
    ) -> Option<Self> {
        let includes_oldest = range.end == tables.len();
        let mut inputs: Vec<Arc<TableHandle>> = Vec::with_capacity(range.len());
        for table in &tables[range] {
            if !table.try_claim() {
                for claimed in &inputs {
                    claimed.release();
                }
                return None;
            }
            inputs.push(Arc::clone(table));
        }
        Some(Self {
            inputs,
            includes_oldest,
            reason,
        })
    }

    /// Newest first.
    pub fn inputs(&self) -> &[Arc<TableHandle>] {
        &self.inputs
    }

    pub fn includes_oldest(&self) -> bool {
        self.includes_oldest
    }

    pub fn reason(&self) -> CompactionReason {
        self.reason
    }

    pub fn input_bytes(&self) -> u64 {
        self.inputs.iter().map(|t| t.file_size()).sum()
    }
}

impl Drop for CompactionPick {
    fn drop(&mut self) {
        for table in &self.inputs {
            table.release();
        }
    }
}

/// First window of >= 2 idle tables whose sizes stay within the ratio.
/// `sizes[i]` is `None` for a table already being compacted.
pub(crate) fn size_ratio_window(sizes: &[Option<u64>], ratio_percent: u32) -> Option<Range<usize>> {
    for start in 0..sizes.len() {
        let Some(first) = sizes[start] else {
            continue;
        };
        let mut total = u128::from(first);
        let mut end = start + 1;
        while let Some(Some(next)) = sizes.get(end) {
            let limit = total * (100 + u128::from(ratio_percent)) / 100;
            if u128::from(*next) > limit {
                break;
            }
            total += u128::from(*next);
            end += 1;
        }
        if end - start >= 2 {
            return Some(start..end);
        }
    }
    None
}

/// Longest run of idle tables, at least two long. Ties go to the newest.
pub(crate) fn longest_idle_run(idle: &[bool]) -> Option<Range<usize>> {
    let mut best: Option<Range<usize>> = None;
    let mut start = 0;
    while start < idle.len() {
        if !idle[start] {
            start += 1;
            continue;
        }
        let mut end = start;
        while end < idle.len() && idle[end] {
            end += 1;
        }
        if end - start >= 2 && best.as_ref().is_none_or(|b| end - start > b.len()) {
            best = Some(start..end);
        }
        start = end;
    }
    best
}

/// Choose the next background compaction, if any is due.
pub fn pick(
    tables: &[Arc<TableHandle>],
    options: &DbOptions,
    seek_candidate: Option<u64>,
) -> Option<CompactionPick> {
    if tables.len() >= options.level0_file_num_compaction_trigger {
        let sizes: Vec<Option<u64>> = tables
            .iter()
            .map(|t| (!t.is_being_compacted()).then(|| t.file_size()))
            .collect();

        if let Some(range) = size_ratio_window(&sizes, options.compaction_size_ratio) {
            if let Some(pick) = CompactionPick::claim(tables, range, CompactionReason::SizeRatio) {
                return Some(pick);
            }
        }

        let idle: Vec<bool> = sizes.iter().map(Option::is_some).collect();
        if let Some(range) = longest_idle_run(&idle) {
            if let Some(pick) = CompactionPick::claim(tables, range, CompactionReason::FileCount) {
                return Some(pick);
            }
        }
    }

    let id = seek_candidate?;
    let position = tables.iter().position(|t| t.id() == id)?;
    let end = (position + 2).min(tables.len());
    CompactionPick::claim(tables, position..end, CompactionReason::Seek)
}

/// Claim every table for a manual full compaction.
pub fn pick_all(tables: &[Arc<TableHandle>]) -> Option<CompactionPick> {
    if tables.len() < 2 {
        return None;
    }
    CompactionPick::claim(tables, 0..tables.len(), CompactionReason::Manual)
}

// ------------------------------------------------------------------------------------------------
// Merging
// ------------------------------------------------------------------------------------------------

/// Streams the merged inputs in internal order, keeping only the newest
/// version of each key.
struct CompactionStream {
    cursor: MergingCursor,
    drop_tombstones: bool,
    last_key: Option<Vec<u8>>,
    peeked: Option<Record>,
    dropped_superseded: u64,
    dropped_tombstones: u64,
}

impl CompactionStream {
    fn new(inputs: &[Arc<TableHandle>], drop_tombstones: bool) -> Self {
        let children = inputs.iter().map(|t| t.cursor(false)).collect();
        let mut cursor = MergingCursor::new(children);
        cursor.seek_to_first();
        Self {
            cursor,
            drop_tombstones,
            last_key: None,
            peeked: None,
            dropped_superseded: 0,
            dropped_tombstones: 0,
        }
    }

    fn advance(&mut self) -> Option<Record> {
        loop {
            let record = self.cursor.current()?;
            let kept = if self.last_key.as_deref() == Some(record.key) {
                self.dropped_superseded += 1;
                None
            } else {
                self.last_key = Some(record.key.to_vec());
                if record.value.is_none() && self.drop_tombstones {
                    self.dropped_tombstones += 1;
                    None
                } else {
                    Some(record.to_record())
                }
            };
            self.cursor.next();
            if kept.is_some() {
                return kept;
            }
        }
    }

    fn is_exhausted(&mut self) -> bool {
        if self.peeked.is_none() {
            self.peeked = self.advance();
        }
        self.peeked.is_none()
    }
}

impl Iterator for CompactionStream {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        self.peeked.take().or_else(|| self.advance())
    }
}

/// What a merge produced.
#[derive(Debug)]
pub struct MergeOutcome {
    /// `None` when every record was dropped.
    pub built: Option<BuiltTable>,
    pub dropped_superseded: u64,
    pub dropped_tombstones: u64,
}

/// Merge the picked tables into a new table at `out_path`.
pub fn merge(
    pick: &CompactionPick,
    out_path: &Path,
    build: &TableBuildOptions,
) -> Result<MergeOutcome, EngineError> {
    let mut stream = CompactionStream::new(pick.inputs(), pick.includes_oldest());

    let built = if stream.is_exhausted() {
        None
    } else {
        Some(table::build_table(out_path, build, &mut stream)?)
    };

    // A read error ends the stream early; the output is then incomplete.
    if let Some(e) = stream.cursor.status() {
        let err = e.duplicate();
        if built.is_some() {
            if let Err(rm) = fs::remove_file(out_path) {
                warn!(path = %out_path.display(), %rm, "failed to remove partial compaction output");
            }
        }
        return Err(err);
    }

    debug!(
        inputs = pick.inputs().len(),
        reason = pick.reason().as_str(),
        dropped_superseded = stream.dropped_superseded,
        dropped_tombstones = stream.dropped_tombstones,
        output = built.is_some(),
        "compaction merge finished"
    );

    Ok(MergeOutcome {
        built,
        dropped_superseded: stream.dropped_superseded,
        dropped_tombstones: stream.dropped_tombstones,
    })
}
