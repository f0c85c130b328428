//! Engine-wide counters and latency/size distributions.
//!
//! Every [`Ticker`] is a monotonically increasing 64-bit count; every
//! [`HistogramType`] is a fixed-bucket histogram. Both are plain atomics, so
//! foreground and background threads update them without locks and no update
//! is ever lost. Querying any defined event returns a value, never an error.

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

// ------------------------------------------------------------------------------------------------
// Event catalogue
// ------------------------------------------------------------------------------------------------

macro_rules! event_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub const COUNT: usize = Self::ALL.len();

            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

event_enum!(
    /// Counter events.
    Ticker {
        BlockCacheMiss => "sedimentdb.block.cache.miss",
        BlockCacheHit => "sedimentdb.block.cache.hit",
        BlockCacheAdd => "sedimentdb.block.cache.add",
        BloomFilterUseful => "sedimentdb.bloom.filter.useful",
        MemtableHit => "sedimentdb.memtable.hit",
        MemtableMiss => "sedimentdb.memtable.miss",
        TableGetHit => "sedimentdb.table.get.hit",
        NumberKeysWritten => "sedimentdb.number.keys.written",
        NumberKeysRead => "sedimentdb.number.keys.read",
        NumberKeysDeleted => "sedimentdb.number.keys.deleted",
        BytesWritten => "sedimentdb.bytes.written",
        BytesRead => "sedimentdb.bytes.read",
        NumberDbSeek => "sedimentdb.number.db.seek",
        NumberDbNext => "sedimentdb.number.db.next",
        NumberDbPrev => "sedimentdb.number.db.prev",
        WalFileBytes => "sedimentdb.wal.bytes",
        WalFileSynced => "sedimentdb.wal.synced",
        StallMicros => "sedimentdb.stall.micros",
        FlushCount => "sedimentdb.flush.count",
        FlushWriteBytes => "sedimentdb.flush.write.bytes",
        CompactionCount => "sedimentdb.compaction.count",
        CompactReadBytes => "sedimentdb.compact.read.bytes",
        CompactWriteBytes => "sedimentdb.compact.write.bytes",
        CompactionKeyDropNewerEntry => "sedimentdb.compaction.key.drop.new",
        CompactionKeyDropObsolete => "sedimentdb.compaction.key.drop.obsolete",
        SeekCompactions => "sedimentdb.compaction.seek.triggered",
        BackgroundErrors => "sedimentdb.background.errors",
    }
);

event_enum!(
    /// Distribution events.
    HistogramType {
        DbGet => "sedimentdb.db.get.micros",
        DbWrite => "sedimentdb.db.write.micros",
        DbSeek => "sedimentdb.db.seek.micros",
        WalFileSyncMicros => "sedimentdb.wal.file.sync.micros",
        FlushTime => "sedimentdb.flush.micros",
        CompactionTime => "sedimentdb.compaction.micros",
        NumFilesInSingleCompaction => "sedimentdb.numfiles.in.singlecompaction",
        BytesPerRead => "sedimentdb.bytes.per.read",
        BytesPerWrite => "sedimentdb.bytes.per.write",
        WriteStall => "sedimentdb.db.write.stall",
    }
);

// ------------------------------------------------------------------------------------------------
// Histogram
// ------------------------------------------------------------------------------------------------

/// Snapshot of one histogram.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HistogramData {
    pub count: u64,
    pub sum: u64,
    pub min: u64,
    pub max: u64,
    pub average: f64,
    pub median: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Upper bounds (inclusive) of the histogram buckets: 1, 2, ... 10, then
/// growing by roughly 1.5x up to `u64::MAX`.
fn bucket_limits() -> &'static [u64] {
    use std::sync::OnceLock;
    static LIMITS: OnceLock<Vec<u64>> = OnceLock::new();
    LIMITS.get_or_init(|| {
        let mut limits: Vec<u64> = (1..=10).collect();
        let mut last = 10u64;
        while let Some(next) = last.checked_add(last / 2) {
            // Keep two significant digits so bucket edges stay readable.
            let mut pow = 1u64;
            while next / pow >= 100 {
                pow *= 10;
            }
            let rounded = (next / pow) * pow;
            limits.push(rounded);
            last = rounded;
        }
        limits.push(u64::MAX);
        limits
    })
}

struct Histogram {
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
    buckets: Vec<AtomicU64>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
            buckets: bucket_limits().iter().map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn add(&self, value: u64) {
        let limits = bucket_limits();
        let idx = limits.partition_point(|&limit| limit < value);
        self.buckets[idx.min(limits.len() - 1)].fetch_add(1, Ordering::Relaxed);
        self.min.fetch_min(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn data(&self) -> HistogramData {
        let counts: Vec<u64> = self
            .buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        let count: u64 = counts.iter().sum();
        if count == 0 {
            return HistogramData::default();
        }
        let sum = self.sum.load(Ordering::Relaxed);
        let min = self.min.load(Ordering::Relaxed);
        let max = self.max.load(Ordering::Relaxed);
        let percentile = |p: f64| percentile(&counts, count, min, max, p);

        HistogramData {
            count,
            sum,
            min,
            max,
            average: sum as f64 / count as f64,
            median: percentile(50.0),
            p95: percentile(95.0),
            p99: percentile(99.0),
        }
    }

    fn reset(&self) {
        for bucket in &self.buckets {
            bucket.store(0, Ordering::Relaxed);
        }
        self.count.store(0, Ordering::Relaxed);
        self.sum.store(0, Ordering::Relaxed);
        self.min.store(u64::MAX, Ordering::Relaxed);
        self.max.store(0, Ordering::Relaxed);
    }
}

/// Linear interpolation inside the bucket holding the `p`-th percentile,
/// clamped to the observed min/max.
fn percentile(counts: &[u64], total: u64, min: u64, max: u64, p: f64) -> f64 {
    let limits = bucket_limits();
    let threshold = total as f64 * (p / 100.0);
    let mut cumulative = 0u64;
    for (idx, &bucket_count) in counts.iter().enumerate() {
        cumulative += bucket_count;
        if cumulative as f64 >= threshold {
            let left = if idx == 0 { 0 } else { limits[idx - 1] };
            let right = limits[idx];
            let before = cumulative - bucket_count;
            let pos = if bucket_count == 0 {
                0.0
            } else {
                (threshold - before as f64) / bucket_count as f64
            };
            let value = left as f64 + (right as f64 - left as f64) * pos;
            return value.clamp(min as f64, max as f64);
        }
    }
    max as f64
}

// ------------------------------------------------------------------------------------------------
// Statistics
// ------------------------------------------------------------------------------------------------

/// Shared statistics sink.
pub struct Statistics {
    tickers: Vec<AtomicU64>,
    histograms: Vec<Histogram>,
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            tickers: Ticker::ALL.iter().map(|_| AtomicU64::new(0)).collect(),
            histograms: HistogramType::ALL.iter().map(|_| Histogram::new()).collect(),
        }
    }

    pub fn record_tick(&self, ticker: Ticker, count: u64) {
        self.tickers[ticker as usize].fetch_add(count, Ordering::Relaxed);
    }

    pub fn ticker_count(&self, ticker: Ticker) -> u64 {
        self.tickers[ticker as usize].load(Ordering::Relaxed)
    }

    pub fn measure(&self, histogram: HistogramType, value: u64) {
        self.histograms[histogram as usize].add(value);
    }

    pub fn histogram_data(&self, histogram: HistogramType) -> HistogramData {
        self.histograms[histogram as usize].data()
    }

    /// Record the time elapsed since `start` in microseconds.
    pub(crate) fn measure_since(&self, histogram: HistogramType, start: Instant) {
        let micros = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.measure(histogram, micros);
    }

    /// Zero every ticker and histogram.
    pub fn reset(&self) {
        for ticker in &self.tickers {
            ticker.store(0, Ordering::Relaxed);
        }
        for histogram in &self.histograms {
            histogram.reset();
        }
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statistics").finish_non_exhaustive()
    }
}

impl fmt::Display for Statistics {
    /// One line per event, `name COUNT : n` for tickers and
    /// `name P50 : .. P95 : .. P99 : .. COUNT : .. SUM : ..` for histograms.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ticker in Ticker::ALL {
            writeln!(f, "{} COUNT : {}", ticker, self.ticker_count(*ticker))?;
        }
        for histogram in HistogramType::ALL {
            let data = self.histogram_data(*histogram);
            writeln!(
                f,
                "{} P50 : {:.6} P95 : {:.6} P99 : {:.6} COUNT : {} SUM : {}",
                histogram, data.median, data.p95, data.p99, data.count, data.sum
            )?;
        }
        Ok(())
    }
}
