//! Online backup and restore of a paginated storage.
//!
//! A backup is a single stream:
//!
//! ```text
//! header   magic "PGDBBKP\0" | version u32 | page size u32 | storage id u32
//!          | transformed u8 | checkpoint segment u64 | checkpoint position u64
//!          | file count u32 | { file id u64 | name len u32 | name }*
//! pages    { TAG_PAGE u8 | file id u64 | page index u64 | len u32 | image }*
//! log      { TAG_WAL_SEGMENT u8 | order u64 | len u64 | bytes }*
//! trailer  TAG_END u8
//! ```
//!
//! All integers are little endian. Page images pass through the optional
//! [`ByteTransform`] on the way out and back in.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::paginated::{PaginatedStorage, DIRTY_MARKER};
use crate::storage::config::{StorageConfig, WAL_DIR_NAME};
use crate::storage::disk::{FileRegistry, PageFile, REGISTRY_FILE_NAME};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{layout, FileId, PageKey};
use crate::storage::wal::segment::WalSegment;
use crate::storage::wal::{Lsn, MasterRecord};

pub const BACKUP_MAGIC: [u8; 8] = *b"PGDBBKP\0";
pub const BACKUP_VERSION: u32 = 1;

const TAG_END: u8 = 0;
const TAG_PAGE: u8 = 1;
const TAG_WAL_SEGMENT: u8 = 2;

/// Hook applied to every page image, e.g. compression or encryption.
pub trait ByteTransform: Send + Sync {
    fn encode(&self, bytes: &[u8]) -> StorageResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> StorageResult<Vec<u8>>;
}

#[derive(Clone, Default)]
pub struct BackupOptions {
    pub transform: Option<Arc<dyn ByteTransform>>,
}

impl BackupOptions {
    pub fn with_transform(transform: Arc<dyn ByteTransform>) -> Self {
        Self {
            transform: Some(transform),
        }
    }

    fn encode(&self, bytes: Vec<u8>) -> StorageResult<Vec<u8>> {
        match &self.transform {
            Some(transform) => transform.encode(&bytes),
            None => Ok(bytes),
        }
    }

    fn decode(&self, bytes: Vec<u8>) -> StorageResult<Vec<u8>> {
        match &self.transform {
            Some(transform) => transform.decode(&bytes),
            None => Ok(bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackupStats {
    pub files: usize,
    pub pages: u64,
    pub wal_segments: usize,
}

fn write_err(e: std::io::Error) -> StorageError {
    StorageError::io("writing backup", e)
}

fn read_err(e: std::io::Error) -> StorageError {
    StorageError::io("reading backup", e)
}

impl PaginatedStorage {
    /// Writes a consistent copy of the storage to `writer`.
    ///
    /// New atomic operations wait until the backup is done. The calling
    /// thread must not have one running.
    pub fn backup<W: Write>(&self, writer: &mut W, options: &BackupOptions) -> StorageResult<BackupStats> {
        let _frozen = self.operations().freeze();
        let checkpoint = self.checkpoints().full_checkpoint()?;
        let write_cache = self.write_cache();
        let files = self.files();
        let mut stats = BackupStats {
            files: files.len(),
            ..Default::default()
        };

        writer.write_all(&BACKUP_MAGIC).map_err(write_err)?;
        writer.write_u32::<LittleEndian>(BACKUP_VERSION).map_err(write_err)?;
        writer
            .write_u32::<LittleEndian>(self.config().page_size as u32)
            .map_err(write_err)?;
        writer
            .write_u32::<LittleEndian>(self.config().storage_id)
            .map_err(write_err)?;
        writer
            .write_u8(options.transform.is_some() as u8)
            .map_err(write_err)?;
        writer
            .write_u64::<LittleEndian>(checkpoint.start_lsn.segment)
            .map_err(write_err)?;
        writer
            .write_u64::<LittleEndian>(checkpoint.start_lsn.position)
            .map_err(write_err)?;
        writer.write_u32::<LittleEndian>(files.len() as u32).map_err(write_err)?;
        for (name, file_id) in &files {
            writer.write_u64::<LittleEndian>(file_id.0).map_err(write_err)?;
            writer.write_u32::<LittleEndian>(name.len() as u32).map_err(write_err)?;
            writer.write_all(name.as_bytes()).map_err(write_err)?;
        }

        let mut image = vec![0u8; self.config().page_size];
        for (_, file_id) in &files {
            for page_index in 0..write_cache.filled_up_to(*file_id)? {
                write_cache.read_page_image(PageKey::new(*file_id, page_index), &mut image)?;
                let bytes = options.encode(image.clone())?;
                writer.write_u8(TAG_PAGE).map_err(write_err)?;
                writer.write_u64::<LittleEndian>(file_id.0).map_err(write_err)?;
                writer.write_u64::<LittleEndian>(page_index).map_err(write_err)?;
                writer.write_u32::<LittleEndian>(bytes.len() as u32).map_err(write_err)?;
                writer.write_all(&bytes).map_err(write_err)?;
                stats.pages += 1;
            }
        }

        for (order, path) in self.wal().segments()? {
            let bytes = fs::read(&path)
                .map_err(|e| StorageError::io(format!("reading WAL segment {}", path.display()), e))?;
            writer.write_u8(TAG_WAL_SEGMENT).map_err(write_err)?;
            writer.write_u64::<LittleEndian>(order).map_err(write_err)?;
            writer.write_u64::<LittleEndian>(bytes.len() as u64).map_err(write_err)?;
            writer.write_all(&bytes).map_err(write_err)?;
            stats.wal_segments += 1;
        }
        writer.write_u8(TAG_END).map_err(write_err)?;
        writer.flush().map_err(write_err)?;

        log::info!(
            "Backed up storage '{}': {} file(s), {} page(s), {} WAL segment(s)",
            self.config().name,
            stats.files,
            stats.pages,
            stats.wal_segments
        );
        Ok(stats)
    }

    /// Rebuilds a storage in `config.path` from a backup stream and opens
    /// it. The target directory must be empty or absent.
    ///
    /// The storage id recorded in the backup replaces `config.storage_id`,
    /// since every file id embeds it.
    pub fn restore<R: Read>(
        mut config: StorageConfig,
        reader: &mut R,
        options: &BackupOptions,
    ) -> StorageResult<Self> {
        config.validate()?;
        ensure_empty(&config.path)?;

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic).map_err(read_err)?;
        if magic != BACKUP_MAGIC {
            return Err(StorageError::Corruption("not a backup stream".into()));
        }
        let version = reader.read_u32::<LittleEndian>().map_err(read_err)?;
        if version != BACKUP_VERSION {
            return Err(StorageError::Corruption(format!(
                "unsupported backup version {}",
                version
            )));
        }
        let page_size = reader.read_u32::<LittleEndian>().map_err(read_err)? as usize;
        if page_size != config.page_size {
            return Err(StorageError::InvalidConfig(format!(
                "backup has {} byte pages, configuration expects {}",
                page_size, config.page_size
            )));
        }
        let storage_id = reader.read_u32::<LittleEndian>().map_err(read_err)?;
        if storage_id != config.storage_id {
            log::info!("Restoring under storage id {} from the backup", storage_id);
            config.storage_id = storage_id;
        }
        let transformed = reader.read_u8().map_err(read_err)? != 0;
        if transformed != options.transform.is_some() {
            return Err(StorageError::InvalidConfig(
                "backup transform does not match the restore options".into(),
            ));
        }
        let checkpoint = Lsn::new(
            reader.read_u64::<LittleEndian>().map_err(read_err)?,
            reader.read_u64::<LittleEndian>().map_err(read_err)?,
        );

        fs::create_dir_all(&config.path)
            .map_err(|e| StorageError::io(format!("creating {}", config.path.display()), e))?;
        let registry = FileRegistry::open(&config.path, storage_id)?;
        let mut files = Vec::new();
        let file_count = reader.read_u32::<LittleEndian>().map_err(read_err)?;
        for _ in 0..file_count {
            let file_id = FileId(reader.read_u64::<LittleEndian>().map_err(read_err)?);
            let len = reader.read_u32::<LittleEndian>().map_err(read_err)? as usize;
            let mut name = vec![0u8; len];
            reader.read_exact(&mut name).map_err(read_err)?;
            let name = String::from_utf8(name)
                .map_err(|_| StorageError::Corruption(format!("file name of {} is not UTF-8", file_id)))?;
            check_file_name(&name)?;
            registry.register(&name, file_id)?;
            let file = PageFile::create(&config.path.join(&name), &name, file_id, page_size)?;
            files.push((file_id, file));
        }

        let wal_dir = config.wal_dir();
        fs::create_dir_all(&wal_dir)
            .map_err(|e| StorageError::io(format!("creating {}", wal_dir.display()), e))?;
        let mut max_page_lsn = Lsn::ZERO;
        loop {
            match reader.read_u8().map_err(read_err)? {
                TAG_END => break,
                TAG_PAGE => {
                    let file_id = FileId(reader.read_u64::<LittleEndian>().map_err(read_err)?);
                    let page_index = reader.read_u64::<LittleEndian>().map_err(read_err)?;
                    let len = reader.read_u32::<LittleEndian>().map_err(read_err)? as usize;
                    let mut bytes = vec![0u8; len];
                    reader.read_exact(&mut bytes).map_err(read_err)?;
                    let image = options.decode(bytes)?;
                    let key = PageKey::new(file_id, page_index);
                    if image.len() != page_size || !layout::verify_checksum(&image) {
                        return Err(StorageError::Corruption(format!("backup image of page {} is damaged", key)));
                    }
                    let (_, file) = files
                        .iter()
                        .find(|(id, _)| *id == file_id)
                        .ok_or_else(|| StorageError::FileNotFound(file_id.to_string()))?;
                    file.write_page(page_index, &image)?;
                    max_page_lsn = max_page_lsn.max(layout::page_lsn(&image));
                }
                TAG_WAL_SEGMENT => {
                    let order = reader.read_u64::<LittleEndian>().map_err(read_err)?;
                    let len = reader.read_u64::<LittleEndian>().map_err(read_err)?;
                    let path = wal_dir.join(WalSegment::file_name(&config.name, order));
                    let mut segment = File::create(&path)
                        .map_err(|e| StorageError::io(format!("creating {}", path.display()), e))?;
                    let copied = std::io::copy(&mut reader.by_ref().take(len), &mut segment)
                        .map_err(|e| StorageError::io(format!("restoring {}", path.display()), e))?;
                    if copied != len {
                        return Err(StorageError::Corruption(format!(
                            "WAL segment {} is truncated in the backup",
                            order
                        )));
                    }
                    segment
                        .sync_all()
                        .map_err(|e| StorageError::io(format!("syncing {}", path.display()), e))?;
                }
                tag => {
                    return Err(StorageError::Corruption(format!("unknown backup entry tag {}", tag)));
                }
            }
        }
        for (_, file) in &files {
            file.sync()?;
        }
        MasterRecord::new(&wal_dir, &config.name).write(checkpoint)?;

        // Opening with the marker present replays the restored log.
        let marker = config.path.join(DIRTY_MARKER);
        File::create(&marker).map_err(|e| StorageError::io(format!("creating {}", marker.display()), e))?;
        drop(files);
        let storage = Self::open(config)?;
        storage.wal().move_lsn_after(max_page_lsn)?;
        log::info!("Restored storage '{}'", storage.config().name);
        Ok(storage)
    }
}

/// A restored file name must name a plain file inside the storage directory.
fn check_file_name(name: &str) -> StorageResult<()> {
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
        && name != REGISTRY_FILE_NAME
        && name != DIRTY_MARKER
        && name != WAL_DIR_NAME;
    if !plain {
        return Err(StorageError::Corruption(format!("backup names an invalid file '{}'", name)));
    }
    Ok(())
}

fn ensure_empty(path: &Path) -> StorageResult<()> {
    match fs::read_dir(path) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(StorageError::InvalidState(format!(
                    "restore target {} is not empty",
                    path.display()
                )));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::io(format!("listing {}", path.display()), e)),
    }
}
