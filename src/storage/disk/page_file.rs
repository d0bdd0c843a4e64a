use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::layout::{
    FILE_FORMAT_VERSION, FILE_HEADER_SIZE, FILE_ID, FILE_MAGIC, FILE_MAGIC_NUMBER, FILE_PAGE_SIZE,
    FILE_VERSION,
};
use crate::storage::page::{FileId, PageKey};

/// A data file: a fixed header followed by fixed-size pages.
pub struct PageFile {
    file_id: FileId,
    name: String,
    path: PathBuf,
    page_size: usize,
    file: Mutex<File>,
    /// Number of pages logically present.
    pages: AtomicU64,
}

impl PageFile {
    pub fn create(path: &Path, name: &str, file_id: FileId, page_size: usize) -> StorageResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => StorageError::FileExists(name.to_string()),
                _ => StorageError::file_io("creating", file_id, e),
            })?;

        let mut header = vec![0u8; FILE_HEADER_SIZE];
        FILE_MAGIC.write_u64(&mut header, FILE_MAGIC_NUMBER);
        FILE_VERSION.write_u32(&mut header, FILE_FORMAT_VERSION);
        FILE_PAGE_SIZE.write_u32(&mut header, page_size as u32);
        FILE_ID.write_u64(&mut header, file_id.0);
        file.write_all(&header)
            .and_then(|_| file.sync_all())
            .map_err(|e| StorageError::file_io("writing header of", file_id, e))?;

        Ok(Self {
            file_id,
            name: name.to_string(),
            path: path.to_path_buf(),
            page_size,
            file: Mutex::new(file),
            pages: AtomicU64::new(0),
        })
    }

    /// Opens an existing data file and validates its header.
    pub fn open(path: &Path, name: &str, file_id: FileId, page_size: usize) -> StorageResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StorageError::FileNotFound(name.to_string()),
                _ => StorageError::file_io("opening", file_id, e),
            })?;

        let mut header = vec![0u8; FILE_HEADER_SIZE];
        file.read_exact(&mut header)
            .map_err(|e| StorageError::file_io("reading header of", file_id, e))?;
        if FILE_MAGIC.read_u64(&header) != FILE_MAGIC_NUMBER {
            return Err(StorageError::Corruption(format!("{} is not a data file", name)));
        }
        let version = FILE_VERSION.read_u32(&header);
        if version != FILE_FORMAT_VERSION {
            return Err(StorageError::Corruption(format!(
                "{} has unsupported format version {}",
                name, version
            )));
        }
        let stored_page_size = FILE_PAGE_SIZE.read_u32(&header) as usize;
        if stored_page_size != page_size {
            return Err(StorageError::InvalidConfig(format!(
                "{} was written with page size {}, configured {}",
                name, stored_page_size, page_size
            )));
        }
        let stored_id = FileId(FILE_ID.read_u64(&header));
        if stored_id != file_id {
            return Err(StorageError::Corruption(format!(
                "{} carries file id {}, registry says {}",
                name, stored_id, file_id
            )));
        }

        let len = file
            .metadata()
            .map_err(|e| StorageError::file_io("reading metadata of", file_id, e))?
            .len();
        let pages = len.saturating_sub(FILE_HEADER_SIZE as u64) / page_size as u64;

        Ok(Self {
            file_id,
            name: name.to_string(),
            path: path.to_path_buf(),
            page_size,
            file: Mutex::new(file),
            pages: AtomicU64::new(pages),
        })
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_count(&self) -> u64 {
        self.pages.load(Ordering::Acquire)
    }

    fn page_offset(&self, page_index: u64) -> u64 {
        FILE_HEADER_SIZE as u64 + page_index * self.page_size as u64
    }

    fn check_buffer(&self, len: usize) -> StorageResult<()> {
        if len != self.page_size {
            return Err(StorageError::InvalidState(format!(
                "buffer of {} bytes used for a {} byte page",
                len, self.page_size
            )));
        }
        Ok(())
    }

    /// Reads a page image. Pages past the end of the file read as zeros and
    /// `false` is returned.
    pub fn read_page(&self, page_index: u64, buf: &mut [u8]) -> StorageResult<bool> {
        self.check_buffer(buf.len())?;
        let key = PageKey::new(self.file_id, page_index);
        let offset = self.page_offset(page_index);

        let mut file = self.file.lock();
        let len = file
            .metadata()
            .map_err(|e| StorageError::page_io("reading", key, e))?
            .len();
        if offset + self.page_size as u64 > len {
            buf.fill(0);
            return Ok(false);
        }
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(buf))
            .map_err(|e| StorageError::page_io("reading", key, e))?;
        Ok(true)
    }

    /// Writes a page image, growing the file if needed. Not synced.
    pub fn write_page(&self, page_index: u64, data: &[u8]) -> StorageResult<()> {
        self.check_buffer(data.len())?;
        let key = PageKey::new(self.file_id, page_index);
        let offset = self.page_offset(page_index);

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(data))
            .map_err(|e| StorageError::page_io("writing", key, e))?;
        self.pages.fetch_max(page_index + 1, Ordering::AcqRel);
        Ok(())
    }

    /// Reserves the next page index and extends the file over it.
    pub fn allocate_page(&self) -> StorageResult<u64> {
        let file = self.file.lock();
        let index = self.pages.load(Ordering::Acquire);
        file.set_len(self.page_offset(index + 1))
            .map_err(|e| StorageError::page_io("allocating", PageKey::new(self.file_id, index), e))?;
        self.pages.store(index + 1, Ordering::Release);
        Ok(index)
    }

    /// Makes sure the file covers `page_index`, as replay may touch pages
    /// allocated after the last flush.
    pub fn ensure_page(&self, page_index: u64) -> StorageResult<()> {
        let file = self.file.lock();
        if page_index < self.pages.load(Ordering::Acquire) {
            return Ok(());
        }
        file.set_len(self.page_offset(page_index + 1))
            .map_err(|e| StorageError::page_io("extending to", PageKey::new(self.file_id, page_index), e))?;
        self.pages.store(page_index + 1, Ordering::Release);
        Ok(())
    }

    /// Cuts the file down to `pages` pages.
    pub fn truncate(&self, pages: u64) -> StorageResult<()> {
        let file = self.file.lock();
        file.set_len(self.page_offset(pages))
            .map_err(|e| StorageError::file_io("truncating", self.file_id, e))?;
        self.pages.store(pages, Ordering::Release);
        Ok(())
    }

    pub fn sync(&self) -> StorageResult<()> {
        self.file
            .lock()
            .sync_data()
            .map_err(|e| StorageError::file_io("syncing", self.file_id, e))
    }
}
