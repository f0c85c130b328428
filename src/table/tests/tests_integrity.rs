#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use crate::iterator::RecordCursor;
    use crate::options::TableFormat;
    use crate::table::tests::helpers::*;
    use crate::table::{FOOTER_SIZE, TableError, TableHandle, build_table};

    fn flip_byte(path: &std::path::Path, offset: usize) {
        let mut bytes = fs::read(path).unwrap();
        bytes[offset] ^= 0xFF;
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn build__empty_input_rejected() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let path = path_for(tmp.path(), 1);
        for format in both_formats() {
            let err = build_table(&path, &build_opts(format), Vec::new()).unwrap_err();
            assert!(matches!(err, TableError::Internal(_)), "{err:?}");
            assert!(!path.exists());
            assert!(!path.with_extension("tmp").exists());
        }
    }

    /// # Scenario
    /// A flipped byte in a data block of a block-based table.
    ///
    /// # Expected behavior
    /// Open succeeds (data blocks are read lazily); the lookup hitting the
    /// damaged block reports corruption and the cursor goes invalid with
    /// an error.
    #[test]
    fn corruption__block_based_data_block_detected_on_read() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let path = path_for(tmp.path(), 1);
        build_table(&path, &build_opts(TableFormat::BlockBased), records(100)).unwrap();
        flip_byte(&path, 10);

        let table = std::sync::Arc::new(TableHandle::open(1, &path, &ctx(0)).unwrap());
        let err = table.get(&key(0), true).unwrap_err();
        assert!(matches!(err, TableError::Corruption(_)), "{err:?}");

        let mut cursor = table.cursor(false);
        cursor.seek_to_first();
        assert!(!cursor.valid());
        assert!(cursor.status().is_some());
    }

    #[test]
    fn corruption__plain_data_detected_on_open() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let path = path_for(tmp.path(), 1);
        build_table(&path, &build_opts(TableFormat::Plain), records(100)).unwrap();
        flip_byte(&path, 10);

        let err = TableHandle::open(1, &path, &ctx(0)).unwrap_err();
        assert!(matches!(err, TableError::Corruption(_)), "{err:?}");
    }

    #[test]
    fn corruption__damaged_footer_or_truncation() {
        init_tracing();
        for format in both_formats() {
            let tmp = TempDir::new().unwrap();
            let path = path_for(tmp.path(), 1);
            build_table(&path, &build_opts(format), records(30)).unwrap();
            let len = fs::metadata(&path).unwrap().len() as usize;

            flip_byte(&path, len - 3);
            assert!(TableHandle::open(1, &path, &ctx(0)).is_err(), "{format:?}");

            fs::write(&path, vec![0u8; FOOTER_SIZE - 1]).unwrap();
            assert!(TableHandle::open(1, &path, &ctx(0)).is_err(), "{format:?}");
        }
    }

    #[test]
    fn open__missing_file_is_io_error() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let err = TableHandle::open(1, &path_for(tmp.path(), 1), &ctx(0)).unwrap_err();
        assert!(matches!(err, TableError::Io(_)), "{err:?}");
    }
}
