#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use crate::statistics::{HistogramData, HistogramType, Statistics, Ticker};

    #[test]
    fn tickers__every_kind_starts_at_zero() {
        let stats = Statistics::new();
        for ticker in Ticker::ALL {
            assert_eq!(stats.ticker_count(*ticker), 0, "{ticker}");
        }
        for histogram in HistogramType::ALL {
            assert_eq!(stats.histogram_data(*histogram), HistogramData::default());
        }
        assert_eq!(Ticker::COUNT, Ticker::ALL.len());
    }

    #[test]
    fn tickers__names_are_unique_and_prefixed() {
        let mut names: Vec<&str> = Ticker::ALL.iter().map(Ticker::name).collect();
        names.extend(HistogramType::ALL.iter().map(HistogramType::name));
        assert!(names.iter().all(|n| n.starts_with("sedimentdb.")));
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
        assert_eq!(Ticker::NumberKeysWritten.to_string(), "sedimentdb.number.keys.written");
    }

    /// # Scenario
    /// Concurrent increments from many threads are never lost.
    ///
    /// # Expected behavior
    /// 8 threads x 10 000 ticks = 80 000.
    #[test]
    fn tickers__concurrent_increments() {
        let stats = Arc::new(Statistics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        stats.record_tick(Ticker::BytesWritten, 1);
                        stats.measure(HistogramType::BytesPerWrite, 3);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.ticker_count(Ticker::BytesWritten), 80_000);
        let data = stats.histogram_data(HistogramType::BytesPerWrite);
        assert_eq!(data.count, 80_000);
        assert_eq!(data.sum, 240_000);
    }

    #[test]
    fn histogram__summary_values() {
        let stats = Statistics::new();
        for v in 1..=100 {
            stats.measure(HistogramType::DbGet, v);
        }
        let data = stats.histogram_data(HistogramType::DbGet);
        assert_eq!(data.count, 100);
        assert_eq!(data.sum, 5050);
        assert_eq!(data.min, 1);
        assert_eq!(data.max, 100);
        assert!((data.average - 50.5).abs() < 1e-9);
        assert!(data.median >= 35.0 && data.median <= 65.0, "median {}", data.median);
        assert!(data.median <= data.p95 && data.p95 <= data.p99);
        assert!(data.p99 <= 100.0);
    }

    #[test]
    fn histogram__single_value_percentiles_clamp() {
        let stats = Statistics::new();
        stats.measure(HistogramType::FlushTime, 1234);
        let data = stats.histogram_data(HistogramType::FlushTime);
        assert_eq!(data.median, 1234.0);
        assert_eq!(data.p99, 1234.0);
    }

    #[test]
    fn reset__zeroes_everything() {
        let stats = Statistics::new();
        stats.record_tick(Ticker::FlushCount, 3);
        stats.measure(HistogramType::CompactionTime, 10);
        stats.reset();
        assert_eq!(stats.ticker_count(Ticker::FlushCount), 0);
        assert_eq!(stats.histogram_data(HistogramType::CompactionTime).count, 0);
    }
}
