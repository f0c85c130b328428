#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};

    use tempfile::TempDir;

    use crate::record::Record;
    use crate::wal::tests::helpers::*;
    use crate::wal::{Wal, WalError, WalHeader};

    const HEADER_END: u64 = (WalHeader::ENCODED_LEN + 4) as u64;

    fn write_segment(path: &std::path::Path, count: u64) -> Vec<u64> {
        let wal: Wal<Record> = Wal::open(path, None).unwrap();
        let mut ends = Vec::new();
        let mut offset = HEADER_END;
        for i in 0..count {
            offset += wal.append(&record(i), false).unwrap() as u64;
            ends.push(offset);
        }
        ends
    }

    /// # Scenario
    /// The last record was cut short by a crash.
    ///
    /// # Starting environment
    /// A segment with 5 records, truncated 3 bytes into the last one.
    ///
    /// # Expected behavior
    /// 4 records, then `UnexpectedEof` at the start of the torn record;
    /// `position()` points there so the tail can be cut.
    #[test]
    fn replay__torn_tail() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let path = segment_path(tmp.path(), 1);
        let ends = write_segment(&path, 5);

        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(ends[3] + 3).unwrap();
        drop(file);

        let wal: Wal<Record> = Wal::open(&path, None).unwrap();
        let mut iter = wal.replay_iter();
        let mut good = 0;
        let mut failure = None;
        for item in iter.by_ref() {
            match item {
                Ok(_) => good += 1,
                Err(e) => failure = Some(e),
            }
        }
        assert_eq!(good, 4);
        assert!(matches!(failure, Some(WalError::UnexpectedEof(at)) if at == ends[3]));
        assert_eq!(iter.position(), ends[3]);

        wal.truncate_to(iter.position()).unwrap();
        wal.append(&record(10), false).unwrap();
        let (records, err) = collect(&wal);
        assert!(err.is_none());
        assert_eq!(records.len(), 5);
        assert_eq!(records[4], record(10));
    }

    /// # Scenario
    /// One byte in the middle of a record flipped on disk.
    ///
    /// # Expected behavior
    /// Replay yields the records before it, then `ChecksumMismatch`.
    #[test]
    fn replay__bit_flip_is_checksum_mismatch() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let path = segment_path(tmp.path(), 1);
        let ends = write_segment(&path, 3);

        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(ends[0] + 6)).unwrap();
        file.write_all(&[0xFF]).unwrap();
        drop(file);

        let wal: Wal<Record> = Wal::open(&path, None).unwrap();
        let (records, err) = collect(&wal);
        assert_eq!(records.len(), 1);
        assert!(matches!(err, Some(WalError::ChecksumMismatch(at)) if at == ends[0]));
    }

    #[test]
    fn open__damaged_header() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let path = segment_path(tmp.path(), 1);
        write_segment(&path, 1);

        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(1)).unwrap();
        file.write_all(b"X").unwrap();
        drop(file);

        let err = Wal::<Record>::open(&path, None).unwrap_err();
        assert!(matches!(err, WalError::InvalidHeader(_)));
    }

    #[test]
    fn open__header_cut_short() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let path = segment_path(tmp.path(), 1);
        std::fs::write(&path, b"SWAL").unwrap();

        let err = Wal::<Record>::open(&path, None).unwrap_err();
        assert!(matches!(err, WalError::InvalidHeader(_)));
    }
}
