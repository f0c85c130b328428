//! Ordered, snapshot-consistent iteration over every layer of the engine.
//!
//! Three layers stack up here:
//!
//! - [`RecordCursor`]: the bidirectional internal-record cursor every
//!   memtable and table produces.
//! - [`MergingCursor`]: merges child cursors into one stream in internal
//!   order. Children are ordered by recency (active memtable first, oldest
//!   table last) and on equal `(key, seq)` the more recent child wins.
//! - [`DbIterator`]: the public iterator. It hides versions newer than its
//!   snapshot sequence, collapses older versions of each key and skips
//!   tombstoned keys.
//!
//! Errors from any cursor do not interrupt positioning calls: the iterator
//! simply becomes invalid and [`DbIterator::status`] reports the error.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::DbError;
use crate::engine::{EngineError, Version};
use crate::record::{RecordRef, SequenceNumber, cmp_internal};
use crate::statistics::{HistogramType, Statistics, Ticker};

/// A bidirectional cursor over internal records `(key ASC, seq DESC)`.
///
/// Positioning calls never fail; a failed read leaves the cursor invalid
/// and the error is kept for [`status`](RecordCursor::status).
pub(crate) trait RecordCursor: Send {
    /// Record under the cursor, `None` when not valid.
    fn current(&self) -> Option<RecordRef<'_>>;

    fn valid(&self) -> bool {
        self.current().is_some()
    }

    fn seek_to_first(&mut self);

    fn seek_to_last(&mut self);

    /// Position at the first record `>= (key, seq)` in internal order.
    fn seek(&mut self, key: &[u8], seq: SequenceNumber);

    fn next(&mut self);

    fn prev(&mut self);

    fn status(&self) -> Option<&EngineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

fn cmp_records(a: &RecordRef<'_>, b: &RecordRef<'_>) -> Ordering {
    cmp_internal(a.key, a.seq, b.key, b.seq)
}

// ------------------------------------------------------------------------------------------------
// MergingCursor
// ------------------------------------------------------------------------------------------------

/// Merge of several cursors, itself a cursor.
///
/// When moving forward, every non-current child sits at its first record
/// after the current one; when moving backward, at its last record before
/// it. Switching direction re-seeks the other children.
pub(crate) struct MergingCursor {
    children: Vec<Box<dyn RecordCursor>>,
    current: Option<usize>,
    direction: Direction,
}

impl MergingCursor {
    /// `children` must be ordered newest layer first.
    pub(crate) fn new(children: Vec<Box<dyn RecordCursor>>) -> Self {
        Self {
            children,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut best: Option<(usize, RecordRef<'_>)> = None;
        for (i, child) in self.children.iter().enumerate() {
            if let Some(record) = child.current() {
                let better = best
                    .as_ref()
                    .is_none_or(|(_, b)| cmp_records(&record, b) == Ordering::Less);
                if better {
                    best = Some((i, record));
                }
            }
        }
        self.current = best.map(|(i, _)| i);
    }

    fn find_largest(&mut self) {
        let mut best: Option<(usize, RecordRef<'_>)> = None;
        // Backward so that ties still favour the newer (lower-index) child.
        for (i, child) in self.children.iter().enumerate().rev() {
            if let Some(record) = child.current() {
                let better = best
                    .as_ref()
                    .is_none_or(|(_, b)| cmp_records(&record, b) != Ordering::Less);
                if better {
                    best = Some((i, record));
                }
            }
        }
        self.current = best.map(|(i, _)| i);
    }

    fn current_position(&self) -> Option<(usize, Vec<u8>, SequenceNumber)> {
        let idx = self.current?;
        let record = self.children[idx].current()?;
        Some((idx, record.key.to_vec(), record.seq))
    }
}

impl RecordCursor for MergingCursor {
    fn current(&self) -> Option<RecordRef<'_>> {
        self.current.and_then(|i| self.children[i].current())
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.direction = Direction::Reverse;
        self.find_largest();
    }

    fn seek(&mut self, key: &[u8], seq: SequenceNumber) {
        for child in &mut self.children {
            child.seek(key, seq);
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn next(&mut self) {
        let Some((idx, key, seq)) = self.current_position() else {
            return;
        };

        if self.direction != Direction::Forward {
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == idx {
                    continue;
                }
                child.seek(&key, seq);
                let at_current = child
                    .current()
                    .is_some_and(|r| cmp_internal(r.key, r.seq, &key, seq) == Ordering::Equal);
                if at_current {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[idx].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        let Some((idx, key, seq)) = self.current_position() else {
            return;
        };

        if self.direction != Direction::Reverse {
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == idx {
                    continue;
                }
                child.seek(&key, seq);
                if child.valid() {
                    // First entry >= current; step before it.
                    child.prev();
                } else {
                    // Every entry is < current.
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[idx].prev();
        self.find_largest();
    }

    fn status(&self) -> Option<&EngineError> {
        self.children.iter().find_map(|c| c.status())
    }
}

// ------------------------------------------------------------------------------------------------
// DbIterator
// ------------------------------------------------------------------------------------------------

/// Iterator over the live keys of a database as of its creation.
///
/// Writes that commit after the iterator was created are never visible
/// through it. The iterator pins every memtable and table it reads from,
/// so compactions may proceed while it is open.
///
/// Obtained from [`Db::iter`](crate::Db::iter). Starts unpositioned; call
/// one of the `seek*` methods first.
///
/// ```no_run
/// # use sedimentdb::{Db, DbOptions};
/// # let db = Db::open("/tmp/db", DbOptions { create_if_missing: true, ..DbOptions::default() })?;
/// let mut it = db.iter()?;
/// it.seek_to_first();
/// while it.valid() {
///     println!("{:?} => {:?}", it.key(), it.value());
///     it.next();
/// }
/// it.status()?;
/// # Ok::<(), sedimentdb::DbError>(())
/// ```
pub struct DbIterator {
    inner: MergingCursor,
    sequence: SequenceNumber,
    direction: Direction,
    valid: bool,
    // Reverse: the entry being yielded. Forward: scratch for the key to skip.
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,
    stats: Arc<Statistics>,
    _version: Arc<Version>,
}

impl std::fmt::Debug for DbIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbIterator")
            .field("sequence", &self.sequence)
            .field("valid", &self.valid)
            .finish_non_exhaustive()
    }
}

impl DbIterator {
    pub(crate) fn new(
        inner: MergingCursor,
        sequence: SequenceNumber,
        version: Arc<Version>,
        stats: Arc<Statistics>,
    ) -> Self {
        Self {
            inner,
            sequence,
            direction: Direction::Forward,
            valid: false,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            stats,
            _version: version,
        }
    }

    /// Snapshot sequence number this iterator reads at.
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Current key, `None` when not valid.
    pub fn key(&self) -> Option<&[u8]> {
        if !self.valid {
            return None;
        }
        match self.direction {
            Direction::Forward => self.inner.current().map(|r| r.key),
            Direction::Reverse => Some(&self.saved_key),
        }
    }

    /// Current value, `None` when not valid.
    pub fn value(&self) -> Option<&[u8]> {
        if !self.valid {
            return None;
        }
        match self.direction {
            Direction::Forward => self.inner.current().and_then(|r| r.value),
            Direction::Reverse => Some(&self.saved_value),
        }
    }

    /// First error met by any underlying cursor.
    pub fn status(&self) -> Result<(), DbError> {
        match self.inner.status() {
            Some(e) => Err(e.to_db_error()),
            None => Ok(()),
        }
    }

    pub fn seek_to_first(&mut self) {
        let start = Instant::now();
        self.stats.record_tick(Ticker::NumberDbSeek, 1);
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.inner.seek_to_first();
        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
        self.stats.measure_since(HistogramType::DbSeek, start);
    }

    pub fn seek_to_last(&mut self) {
        let start = Instant::now();
        self.stats.record_tick(Ticker::NumberDbSeek, 1);
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.inner.seek_to_last();
        self.find_prev_user_entry();
        self.stats.measure_since(HistogramType::DbSeek, start);
    }

    /// Position at the first live key `>= target`.
    pub fn seek(&mut self, target: &[u8]) {
        let start = Instant::now();
        self.stats.record_tick(Ticker::NumberDbSeek, 1);
        self.direction = Direction::Forward;
        self.saved_key.clear();
        self.saved_value.clear();
        self.inner.seek(target, self.sequence);
        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
        self.stats.measure_since(HistogramType::DbSeek, start);
    }

    /// Advance to the next live key. No-op when not valid.
    pub fn next(&mut self) {
        if !self.valid {
            return;
        }
        self.stats.record_tick(Ticker::NumberDbNext, 1);

        if self.direction == Direction::Reverse {
            self.direction = Direction::Forward;
            // The inner cursor sits just before the entries of saved_key.
            if self.inner.valid() {
                self.inner.next();
            } else {
                self.inner.seek_to_first();
            }
            if !self.inner.valid() {
                self.invalidate();
                return;
            }
        } else {
            self.saved_key.clear();
            if let Some(record) = self.inner.current() {
                self.saved_key.extend_from_slice(record.key);
            }
            self.inner.next();
            if !self.inner.valid() {
                self.invalidate();
                return;
            }
        }
        self.find_next_user_entry(true);
    }

    /// Step back to the previous live key. No-op when not valid.
    pub fn prev(&mut self) {
        if !self.valid {
            return;
        }
        self.stats.record_tick(Ticker::NumberDbPrev, 1);

        if self.direction == Direction::Forward {
            self.saved_key.clear();
            if let Some(record) = self.inner.current() {
                self.saved_key.extend_from_slice(record.key);
            }
            loop {
                self.inner.prev();
                let before_saved = self
                    .inner
                    .current()
                    .map(|r| r.key < self.saved_key.as_slice());
                match before_saved {
                    None => {
                        self.invalidate();
                        return;
                    }
                    Some(true) => break,
                    Some(false) => {}
                }
            }
            self.direction = Direction::Reverse;
        }
        self.find_prev_user_entry();
    }

    fn invalidate(&mut self) {
        self.valid = false;
        self.saved_key.clear();
        self.saved_value.clear();
    }

    /// Move forward to the newest visible, non-deleted version of the next
    /// key. With `skipping`, versions of keys `<= saved_key` are hidden.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        while let Some(record) = self.inner.current() {
            if record.seq <= self.sequence {
                match record.value {
                    None => {
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(record.key);
                        skipping = true;
                    }
                    Some(_) if skipping && record.key <= self.saved_key.as_slice() => {}
                    Some(_) => {
                        self.valid = true;
                        self.saved_key.clear();
                        return;
                    }
                }
            }
            self.inner.next();
        }
        self.invalidate();
    }

    /// Move backward collecting the newest visible version of the previous
    /// key into `saved_key`/`saved_value`, leaving the inner cursor just
    /// before that key's entries.
    fn find_prev_user_entry(&mut self) {
        let mut found_value = false;
        while let Some(record) = self.inner.current() {
            if record.seq <= self.sequence {
                if found_value && record.key < self.saved_key.as_slice() {
                    break;
                }
                match record.value {
                    None => {
                        found_value = false;
                        self.saved_key.clear();
                        self.saved_value.clear();
                    }
                    Some(value) => {
                        found_value = true;
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(record.key);
                        self.saved_value.clear();
                        self.saved_value.extend_from_slice(value);
                    }
                }
            }
            self.inner.prev();
        }

        if found_value {
            self.valid = true;
        } else {
            self.invalidate();
            self.direction = Direction::Forward;
        }
    }
}
