#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use tempfile::TempDir;

    use crate::engine::TABLE_DIR;
    use crate::engine::tests::helpers::*;
    use crate::options::{DbOptions, ReadOptions};
    use crate::statistics::{HistogramType, Ticker};

    /// Flush `rounds` tables, each overwriting keys `0..keys`.
    fn stacked_tables(engine: &crate::engine::Engine, rounds: usize, keys: usize) {
        for round in 0..rounds {
            fill(engine, 0..keys, round);
            engine.flush_all().unwrap();
        }
    }

    /// # Scenario
    /// A manual full compaction leaves one table with the live data.
    ///
    /// # Starting environment
    /// Three tables overwriting the same keys, with some keys deleted in
    /// the newest one.
    ///
    /// # Expected behavior
    /// One table; input files gone from disk; reads and scans unchanged;
    /// dropped-entry tickers account for superseded versions and tombstones.
    #[test]
    fn compact_all__merges_stack_into_one() {
        let tmp = TempDir::new().unwrap();
        let engine = open(tmp.path(), memtable_only_options());
        stacked_tables(&engine, 2, 50);
        for i in 0..10 {
            delete(&engine, &key(i));
        }
        engine.flush_all().unwrap();
        assert_eq!(engine.stats().unwrap().table_count, 3);
        let before = scan(&engine);

        assert!(engine.compact_all().unwrap());

        let stats = engine.stats().unwrap();
        assert_eq!(stats.table_count, 1);
        assert_eq!(list(&tmp.path().join(TABLE_DIR)).len(), 1);
        assert_eq!(scan(&engine), before);
        assert_eq!(before.len(), 40);
        assert_eq!(get(&engine, &key(3)), None);
        assert_eq!(get(&engine, &key(30)), Some(value(30, 1)));

        let statistics = engine.statistics();
        assert_eq!(statistics.ticker_count(Ticker::CompactionCount), 1);
        assert_eq!(statistics.ticker_count(Ticker::CompactionKeyDropObsolete), 10);
        // Every round-0 version plus the round-1 versions behind the deletes.
        assert_eq!(statistics.ticker_count(Ticker::CompactionKeyDropNewerEntry), 60);
        assert_eq!(
            statistics
                .histogram_data(HistogramType::NumFilesInSingleCompaction)
                .max,
            3
        );
    }

    #[test]
    fn compact_all__needs_two_tables() {
        let tmp = TempDir::new().unwrap();
        let engine = open(tmp.path(), memtable_only_options());
        assert!(!engine.compact_all().unwrap());
        stacked_tables(&engine, 1, 10);
        assert!(!engine.compact_all().unwrap());
    }

    #[test]
    fn compact_all__everything_deleted_leaves_no_table() {
        let tmp = TempDir::new().unwrap();
        let engine = open(tmp.path(), memtable_only_options());
        stacked_tables(&engine, 1, 10);
        for i in 0..10 {
            delete(&engine, &key(i));
        }
        engine.flush_all().unwrap();

        assert!(engine.compact_all().unwrap());
        assert_eq!(engine.stats().unwrap().table_count, 0);
        assert!(list(&tmp.path().join(TABLE_DIR)).is_empty());
        assert!(scan(&engine).is_empty());
    }

    /// # Scenario
    /// An open iterator pins the tables it reads while a compaction
    /// replaces them.
    #[test]
    fn compact_all__open_iterator_keeps_its_snapshot() {
        let tmp = TempDir::new().unwrap();
        let engine = open(tmp.path(), memtable_only_options());
        stacked_tables(&engine, 3, 20);

        let mut it = engine.iter(&ReadOptions::default()).unwrap();
        assert!(engine.compact_all().unwrap());
        // Three inputs pinned by the iterator plus the output.
        assert_eq!(list(&tmp.path().join(TABLE_DIR)).len(), 4);

        put(&engine, &key(0), "after-iterator");
        it.seek_to_first();
        assert_eq!(it.value(), Some(value(0, 2).as_bytes()));
        let mut n = 0;
        while it.valid() {
            n += 1;
            it.next();
        }
        assert_eq!(n, 20);

        drop(it);
        assert_eq!(list(&tmp.path().join(TABLE_DIR)).len(), 1);
    }

    #[test]
    fn compact_once__triggered_by_table_count() {
        let tmp = TempDir::new().unwrap();
        let engine = open(
            tmp.path(),
            DbOptions {
                level0_file_num_compaction_trigger: 4,
                ..memtable_only_options()
            },
        );
        stacked_tables(&engine, 3, 30);
        assert!(!engine.compact_once().unwrap());

        stacked_tables(&engine, 1, 30);
        assert!(engine.compact_once().unwrap());
        assert!(engine.stats().unwrap().table_count < 4);
        for i in 0..30 {
            assert_eq!(get(&engine, &key(i)), Some(value(i, 0)));
        }
    }

    /// # Scenario
    /// Lookups that keep reading a newer table in vain charge its seek
    /// allowance; once exhausted, a seek compaction merges it away.
    ///
    /// # Starting environment
    /// No filters, so every lookup reads data. An older table holds
    /// `old-*` keys, a newer one `new-*` keys.
    #[test]
    fn compact_once__seek_compaction() {
        let tmp = TempDir::new().unwrap();
        let engine = open(
            tmp.path(),
            DbOptions {
                filter_policy: None,
                ..memtable_only_options()
            },
        );
        put(&engine, "old-1", "x");
        engine.flush_all().unwrap();
        put(&engine, "new-1", "y");
        engine.flush_all().unwrap();
        assert!(!engine.compact_once().unwrap());

        let mut flagged = 0;
        for _ in 0..150 {
            let lookup = engine.get(b"old-1", &ReadOptions::default()).unwrap();
            assert_eq!(lookup.value, Some(b"x".to_vec()));
            if lookup.seek_compaction {
                flagged += 1;
            }
        }
        assert_eq!(flagged, 1);

        assert!(engine.compact_once().unwrap());
        assert_eq!(engine.stats().unwrap().table_count, 1);
        assert_eq!(engine.statistics().ticker_count(Ticker::SeekCompactions), 1);
        assert_eq!(get(&engine, "new-1").as_deref(), Some("y"));
    }

    #[test]
    fn compact_once__seek_compaction_can_be_disabled() {
        let tmp = TempDir::new().unwrap();
        let engine = open(
            tmp.path(),
            DbOptions {
                filter_policy: None,
                disable_seek_compaction: true,
                ..memtable_only_options()
            },
        );
        put(&engine, "old-1", "x");
        engine.flush_all().unwrap();
        put(&engine, "new-1", "y");
        engine.flush_all().unwrap();

        for _ in 0..150 {
            assert!(!engine.get(b"old-1", &ReadOptions::default()).unwrap().seek_compaction);
        }
        assert!(!engine.compact_once().unwrap());
    }

    #[test]
    fn compaction__survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = open(tmp.path(), memtable_only_options());
            stacked_tables(&engine, 3, 25);
            engine.compact_all().unwrap();
            put(&engine, "late", "write");
            engine.close().unwrap();
        }
        let engine = open(tmp.path(), memtable_only_options());
        let stats = engine.stats().unwrap();
        assert_eq!(stats.table_count, 1);
        assert_eq!(stats.last_sequence, 76);
        assert_eq!(get(&engine, &key(24)), Some(value(24, 2)));
        assert_eq!(get(&engine, "late").as_deref(), Some("write"));
    }
}
