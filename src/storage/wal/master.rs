//! WAL master record.
//!
//! A tiny side file, `<name>.wmr`, naming the start of the last completed
//! checkpoint. It is replaced atomically through a temp file and a rename, so
//! a crash leaves either the old or the new content.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use super::record::Lsn;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::layout::CRC32C;

pub const MASTER_RECORD_EXTENSION: &str = "wmr";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct MasterRecordData {
    checkpoint: Lsn,
}

pub struct MasterRecord {
    path: PathBuf,
}

impl MasterRecord {
    pub fn new(dir: &Path, name: &str) -> Self {
        MasterRecord {
            path: dir.join(format!("{}.{}", name, MASTER_RECORD_EXTENSION)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start of the last completed checkpoint. A missing or damaged master
    /// record yields `None`, and recovery then replays the whole log.
    pub fn read(&self) -> StorageResult<Option<Lsn>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io("reading WAL master record", e)),
        };
        if bytes.len() < 4 {
            log::warn!("WAL master record is truncated; ignoring it");
            return Ok(None);
        }
        let (body, crc) = bytes.split_at(bytes.len() - 4);
        if CRC32C.checksum(body) != LittleEndian::read_u32(crc) {
            log::warn!("WAL master record fails its checksum; ignoring it");
            return Ok(None);
        }
        let data: MasterRecordData = bincode::deserialize(body)?;
        Ok(Some(data.checkpoint))
    }

    pub fn write(&self, checkpoint: Lsn) -> StorageResult<()> {
        let mut bytes = bincode::serialize(&MasterRecordData { checkpoint })?;
        let mut crc = [0u8; 4];
        LittleEndian::write_u32(&mut crc, CRC32C.checksum(&bytes));
        bytes.extend_from_slice(&crc);

        let tmp = self.path.with_extension(format!("{}.tmp", MASTER_RECORD_EXTENSION));
        let io = |e: std::io::Error| StorageError::io("writing WAL master record", e);
        let mut file = File::create(&tmp).map_err(io)?;
        file.write_all(&bytes).map_err(io)?;
        file.sync_all().map_err(io)?;
        fs::rename(&tmp, &self.path).map_err(io)?;
        Ok(())
    }

    pub fn remove(&self) -> StorageResult<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(StorageError::io("removing WAL master record", e))
            }
            _ => Ok(()),
        }
    }
}
