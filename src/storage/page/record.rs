//! Layout of a page holding a single record.
//!
//! `length: i32 @0 | bytes @4`, relative to the data area. A length of
//! [`DELETED`] marks a deleted record; a page never written holds an empty
//! record.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{DurablePage, PageView};

pub const RECORD_LENGTH_OFFSET: usize = 0;
pub const RECORD_DATA_OFFSET: usize = 4;
pub const DELETED: i32 = -1;

/// Largest record a page of `data_size` usable bytes can hold.
pub fn max_record_size(data_size: usize) -> usize {
    data_size.saturating_sub(RECORD_DATA_OFFSET)
}

pub fn write_record(page: &mut DurablePage<'_>, bytes: &[u8]) -> StorageResult<()> {
    let max = max_record_size(page.data_size());
    if bytes.len() > max {
        return Err(StorageError::InvalidDiff(format!(
            "record of {} bytes does not fit in {} bytes",
            bytes.len(),
            max
        )));
    }
    page.set_int(RECORD_LENGTH_OFFSET, bytes.len() as i32)?;
    page.set_bytes(RECORD_DATA_OFFSET, bytes)
}

/// `None` if the record was deleted.
pub fn read_record(page: PageView<'_>) -> StorageResult<Option<Vec<u8>>> {
    let len = page.get_int(RECORD_LENGTH_OFFSET)?;
    if len == DELETED {
        return Ok(None);
    }
    if len < 0 || len as usize > max_record_size(page.data_size()) {
        return Err(StorageError::Corruption(format!("record length {} out of range", len)));
    }
    Ok(Some(page.get_bytes(RECORD_DATA_OFFSET, len as usize)?.to_vec()))
}

/// Zeroes the record and marks it deleted. Returns false if it already was.
pub fn delete_record(page: &mut DurablePage<'_>) -> StorageResult<bool> {
    let len = page.get_int(RECORD_LENGTH_OFFSET)?;
    if len == DELETED {
        return Ok(false);
    }
    if len > 0 {
        page.fill(RECORD_DATA_OFFSET, len as usize, 0)?;
    }
    page.set_int(RECORD_LENGTH_OFFSET, DELETED)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::{DiffRecorder, PAGE_HEADER_SIZE};

    #[test]
    fn test_write_read_delete() {
        let mut data = vec![0u8; 4096];
        let mut recorder = DiffRecorder::new();
        let mut page = DurablePage::recording(&mut data, &mut recorder);

        assert_eq!(read_record(page.view()).unwrap(), Some(Vec::new()));
        write_record(&mut page, b"record").unwrap();
        assert_eq!(read_record(page.view()).unwrap(), Some(b"record".to_vec()));

        assert!(delete_record(&mut page).unwrap());
        assert_eq!(read_record(page.view()).unwrap(), None);
        assert!(!delete_record(&mut page).unwrap());
        assert_eq!(page.get_bytes(RECORD_DATA_OFFSET, 6).unwrap(), vec![0; 6]);
    }

    #[test]
    fn test_oversized_record_is_refused() {
        let mut data = vec![0u8; 4096];
        let mut page = DurablePage::untracked(&mut data);
        let max = max_record_size(4096 - PAGE_HEADER_SIZE);

        assert!(write_record(&mut page, &vec![1u8; max]).is_ok());
        assert!(matches!(
            write_record(&mut page, &vec![1u8; max + 1]),
            Err(StorageError::InvalidDiff(_))
        ));
    }
}
