//! Arena-backed probabilistic skip list.
//!
//! Nodes live in a `Vec` and link to each other by index, so the whole list
//! is a single allocation that is dropped at once with its memtable. Nodes
//! are never removed. Tower heights are drawn with probability
//! `1 / branching_factor` per extra level, capped at `max_height`.

use std::cmp::Ordering;

use rand::Rng;

use crate::record::{MAX_SEQUENCE, Record, cmp_internal};

struct Node {
    record: Record,
    next: Vec<Option<usize>>,
}

pub(crate) struct SkipList {
    head: Vec<Option<usize>>,
    nodes: Vec<Node>,
    height: usize,
    branching_factor: u32,
}

impl SkipList {
    pub(crate) fn new(max_height: usize, branching_factor: usize) -> Self {
        Self {
            head: vec![None; max_height.max(1)],
            nodes: Vec::new(),
            height: 1,
            branching_factor: u32::try_from(branching_factor.max(2)).unwrap_or(u32::MAX),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    fn max_height(&self) -> usize {
        self.head.len()
    }

    fn next_of(&self, node: Option<usize>, level: usize) -> Option<usize> {
        match node {
            None => self.head[level],
            Some(idx) => self.nodes[idx].next[level],
        }
    }

    fn set_next(&mut self, node: Option<usize>, level: usize, target: Option<usize>) {
        match node {
            None => self.head[level] = target,
            Some(idx) => self.nodes[idx].next[level] = target,
        }
    }

    fn random_height(&self) -> usize {
        let mut rng = rand::rng();
        let mut height = 1;
        while height < self.max_height() && rng.random_range(0..self.branching_factor) == 0 {
            height += 1;
        }
        height
    }

    fn cmp_node(&self, idx: usize, key: &[u8], seq: u64) -> Ordering {
        let record = &self.nodes[idx].record;
        cmp_internal(&record.key, record.seq, key, seq)
    }

    /// Walk towards `(key, seq)`, filling `prev` with the last node before
    /// it on every level. Returns the first node `>= (key, seq)`.
    fn find_ge_with_prev(
        &self,
        key: &[u8],
        seq: u64,
        mut prev: Option<&mut [Option<usize>]>,
    ) -> Option<usize> {
        let mut node = None;
        let mut level = self.height - 1;
        loop {
            let next = self.next_of(node, level);
            match next {
                Some(idx) if self.cmp_node(idx, key, seq) == Ordering::Less => node = Some(idx),
                _ => {
                    if let Some(prev) = prev.as_deref_mut() {
                        prev[level] = node;
                    }
                    if level == 0 {
                        return next;
                    }
                    level -= 1;
                }
            }
        }
    }

    pub(crate) fn insert(&mut self, record: Record) {
        let mut prev = vec![None; self.max_height()];
        self.find_ge_with_prev(&record.key, record.seq, Some(&mut prev));

        let height = self.random_height();
        // Levels above the current height start at the head, which `prev`
        // already holds as `None`.
        self.height = self.height.max(height);

        let idx = self.nodes.len();
        let next = (0..height).map(|level| self.next_of(prev[level], level)).collect();
        self.nodes.push(Node { record, next });
        for (level, &before) in prev.iter().enumerate().take(height) {
            self.set_next(before, level, Some(idx));
        }
    }

    pub(crate) fn find_ge(&self, key: &[u8], seq: u64) -> Option<&Record> {
        self.find_ge_with_prev(key, seq, None)
            .map(|idx| &self.nodes[idx].record)
    }

    /// First record strictly after `(key, seq)`.
    pub(crate) fn find_gt(&self, key: &[u8], seq: u64) -> Option<&Record> {
        match seq.checked_sub(1) {
            Some(lower) => self.find_ge(key, lower),
            None => {
                // Every version of `key` is behind us; the next candidate is
                // the smallest key greater than it.
                let mut successor = Vec::with_capacity(key.len() + 1);
                successor.extend_from_slice(key);
                successor.push(0);
                self.find_ge(&successor, MAX_SEQUENCE)
            }
        }
    }

    /// Last record strictly before `(key, seq)`.
    pub(crate) fn find_lt(&self, key: &[u8], seq: u64) -> Option<&Record> {
        let mut node = None;
        let mut level = self.height - 1;
        loop {
            match self.next_of(node, level) {
                Some(idx) if self.cmp_node(idx, key, seq) == Ordering::Less => node = Some(idx),
                _ if level == 0 => return node.map(|idx| &self.nodes[idx].record),
                _ => level -= 1,
            }
        }
    }

    pub(crate) fn first(&self) -> Option<&Record> {
        self.head[0].map(|idx| &self.nodes[idx].record)
    }

    pub(crate) fn last(&self) -> Option<&Record> {
        let mut node = None;
        let mut level = self.height - 1;
        loop {
            match self.next_of(node, level) {
                Some(idx) => node = Some(idx),
                None if level == 0 => return node.map(|idx| &self.nodes[idx].record),
                None => level -= 1,
            }
        }
    }

    /// All records in internal order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Record> + '_ {
        let mut cursor = self.head[0];
        std::iter::from_fn(move || {
            let idx = cursor?;
            cursor = self.nodes[idx].next[0];
            Some(&self.nodes[idx].record)
        })
    }
}
