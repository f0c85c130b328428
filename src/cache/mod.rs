//! Byte-charged LRU cache shared by all block-based tables.
//!
//! Entries carry an explicit charge (decoded block size). Inserting past
//! capacity evicts least-recently-used entries until the total charge fits
//! again; an entry larger than the whole cache is not retained at all.
//! Recency is tracked with a monotonically increasing tick per access, kept
//! in a `BTreeMap` so the oldest entry is always the first one.


use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Mutex;

struct Slot<V> {
    value: V,
    charge: usize,
    tick: u64,
}

struct LruInner<K, V> {
    map: HashMap<K, Slot<V>>,
    order: BTreeMap<u64, K>,
    usage: usize,
    next_tick: u64,
}

/// Thread-safe LRU cache.
pub struct LruCache<K, V> {
    capacity: usize,
    inner: Mutex<LruInner<K, V>>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(LruInner {
                map: HashMap::new(),
                order: BTreeMap::new(),
                usage: 0,
                next_tick: 0,
            }),
        }
    }

    /// Look up `key`, marking it most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut guard = self.inner.lock().ok()?;
        let inner = &mut *guard;
        let tick = inner.next_tick;
        let slot = inner.map.get_mut(key)?;
        inner.order.remove(&slot.tick);
        slot.tick = tick;
        inner.order.insert(tick, key.clone());
        inner.next_tick += 1;
        Some(slot.value.clone())
    }

    /// Insert or replace `key`. Returns `false` if the entry could not be
    /// retained (it alone exceeds the capacity or the cache is poisoned).
    pub fn insert(&self, key: K, value: V, charge: usize) -> bool {
        if charge > self.capacity {
            return false;
        }
        let Ok(mut guard) = self.inner.lock() else {
            return false;
        };
        let inner = &mut *guard;

        if let Some(old) = inner.map.remove(&key) {
            inner.order.remove(&old.tick);
            inner.usage -= old.charge;
        }

        while inner.usage + charge > self.capacity {
            let Some((_, victim)) = inner.order.pop_first() else {
                break;
            };
            if let Some(evicted) = inner.map.remove(&victim) {
                inner.usage -= evicted.charge;
            }
        }

        let tick = inner.next_tick;
        inner.next_tick += 1;
        inner.order.insert(tick, key.clone());
        inner.map.insert(
            key,
            Slot {
                value,
                charge,
                tick,
            },
        );
        inner.usage += charge;
        true
    }

    /// Drop every entry for which `keep` returns `false`.
    pub fn retain(&self, mut keep: impl FnMut(&K) -> bool) {
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        let inner = &mut *guard;
        let doomed: Vec<K> = inner.map.keys().filter(|k| !keep(k)).cloned().collect();
        for key in doomed {
            if let Some(slot) = inner.map.remove(&key) {
                inner.order.remove(&slot.tick);
                inner.usage -= slot.charge;
            }
        }
    }

    /// Current total charge.
    pub fn usage(&self) -> usize {
        self.inner.lock().map(|inner| inner.usage).unwrap_or(0)
    }

    /// Whether the cache holds no entries.
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().map(|inner| inner.map.is_empty()).unwrap_or(true)
    }
}
