//! Persistent name ↔ file id map of one storage.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::layout::CRC32C;
use crate::storage::page::FileId;

pub const REGISTRY_FILE_NAME: &str = "name_id_map.cm";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryData {
    next_local_id: u32,
    files: BTreeMap<String, u32>,
}

pub struct FileRegistry {
    path: PathBuf,
    storage_id: u32,
    data: Mutex<RegistryData>,
}

impl FileRegistry {
    /// Loads the registry from `dir`. A missing registry is created empty
    /// and written out at once.
    pub fn open(dir: &Path, storage_id: u32) -> StorageResult<Self> {
        let path = dir.join(REGISTRY_FILE_NAME);
        let (data, created) = match fs::read(&path) {
            Ok(bytes) => (Self::decode(&bytes)?, false),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let data = RegistryData {
                    next_local_id: 1,
                    files: BTreeMap::new(),
                };
                (data, true)
            }
            Err(e) => return Err(StorageError::io("reading file registry", e)),
        };
        let registry = Self {
            path,
            storage_id,
            data: Mutex::new(data),
        };
        if created {
            registry.persist(&registry.data.lock())?;
            log::debug!("Created file registry {}", registry.path.display());
        }
        Ok(registry)
    }

    fn decode(bytes: &[u8]) -> StorageResult<RegistryData> {
        if bytes.len() < 4 {
            return Err(StorageError::Corruption("file registry is truncated".into()));
        }
        let (body, crc) = bytes.split_at(bytes.len() - 4);
        if CRC32C.checksum(body) != LittleEndian::read_u32(crc) {
            return Err(StorageError::Corruption("file registry fails its checksum".into()));
        }
        Ok(bincode::deserialize(body)?)
    }

    fn persist(&self, data: &RegistryData) -> StorageResult<()> {
        let mut bytes = bincode::serialize(data)?;
        let mut crc = [0u8; 4];
        LittleEndian::write_u32(&mut crc, CRC32C.checksum(&bytes));
        bytes.extend_from_slice(&crc);

        let tmp = self.path.with_extension("cm.tmp");
        let io = |e: std::io::Error| StorageError::io("writing file registry", e);
        let mut file = File::create(&tmp).map_err(io)?;
        file.write_all(&bytes).map_err(io)?;
        file.sync_all().map_err(io)?;
        fs::rename(&tmp, &self.path).map_err(io)
    }

    pub fn storage_id(&self) -> u32 {
        self.storage_id
    }

    pub fn file_id(&self, name: &str) -> Option<FileId> {
        self.data
            .lock()
            .files
            .get(name)
            .map(|&local| FileId::compose(self.storage_id, local))
    }

    pub fn file_name(&self, file_id: FileId) -> Option<String> {
        if file_id.storage_id() != self.storage_id {
            return None;
        }
        self.data
            .lock()
            .files
            .iter()
            .find(|(_, &local)| local == file_id.local_id())
            .map(|(name, _)| name.clone())
    }

    /// Assigns a fresh id to `name` and persists the mapping.
    pub fn reserve(&self, name: &str) -> StorageResult<FileId> {
        let mut data = self.data.lock();
        if data.files.contains_key(name) {
            return Err(StorageError::FileExists(name.to_string()));
        }
        let mut updated = data.clone();
        let local = updated.next_local_id;
        updated.next_local_id += 1;
        updated.files.insert(name.to_string(), local);
        self.persist(&updated)?;
        *data = updated;
        Ok(FileId::compose(self.storage_id, local))
    }

    /// Records a known mapping, as found in the log during replay.
    pub fn register(&self, name: &str, file_id: FileId) -> StorageResult<()> {
        let mut data = self.data.lock();
        if data.files.get(name) == Some(&file_id.local_id()) {
            return Ok(());
        }
        let mut updated = data.clone();
        updated.files.insert(name.to_string(), file_id.local_id());
        updated.next_local_id = updated.next_local_id.max(file_id.local_id() + 1);
        self.persist(&updated)?;
        *data = updated;
        Ok(())
    }

    /// Drops the mapping of `file_id`, returning the file name it had.
    pub fn remove(&self, file_id: FileId) -> StorageResult<Option<String>> {
        let mut data = self.data.lock();
        let name = data
            .files
            .iter()
            .find(|(_, &local)| local == file_id.local_id())
            .map(|(name, _)| name.clone());
        if let Some(name) = &name {
            let mut updated = data.clone();
            updated.files.remove(name);
            self.persist(&updated)?;
            *data = updated;
        }
        Ok(name)
    }

    pub fn files(&self) -> Vec<(String, FileId)> {
        self.data
            .lock()
            .files
            .iter()
            .map(|(name, &local)| (name.clone(), FileId::compose(self.storage_id, local)))
            .collect()
    }
}
