//! Segmented write-ahead log.
//!
//! Records are framed and appended to an in-memory buffer, then written to
//! the active segment when the buffer fills up or on an explicit flush. A
//! flush also syncs the segment and advances the flushed LSN, the durability
//! watermark the write cache checks before writing any page.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};

use super::master::MasterRecord;
use super::record::{Lsn, WalRecord};
use super::segment::{encode_frame, Frame, WalSegment};
use crate::storage::config::WalConfig;
use crate::storage::error::{StorageError, StorageResult};
use crate::transaction::OperationUnitId;

struct WalState {
    /// Ascending by order; the last one is active.
    segments: Vec<WalSegment>,
    /// Frames appended but not yet written to the active segment.
    buffer: BytesMut,
    last_lsn: Option<Lsn>,
    closed: bool,
}

impl WalState {
    fn active(&self) -> &WalSegment {
        // A log always has at least its active segment.
        &self.segments[self.segments.len() - 1]
    }

    fn active_mut(&mut self) -> &mut WalSegment {
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }

    fn active_len(&self) -> u64 {
        self.active().size() + self.buffer.len() as u64
    }

    fn segment(&self, order: u64) -> Option<&WalSegment> {
        self.segments
            .binary_search_by_key(&order, WalSegment::order)
            .ok()
            .map(|i| &self.segments[i])
    }

    fn check_open(&self) -> StorageResult<()> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

/// The write-ahead log of one storage.
pub struct WriteAheadLog {
    config: WalConfig,
    dir: PathBuf,
    name: String,
    state: Mutex<WalState>,
    flushed_lsn: RwLock<Option<Lsn>>,
    /// LSNs below which segments must be kept, with a holder count each.
    cut_till_limits: Mutex<BTreeMap<Lsn, usize>>,
    master: MasterRecord,
}

impl WriteAheadLog {
    /// Opens the log in `dir`, creating the directory if needed.
    ///
    /// Existing segments are kept; a torn tail of the last one is truncated.
    /// Writing always continues in a fresh segment.
    pub fn open(dir: &Path, name: &str, config: WalConfig) -> StorageResult<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| StorageError::io(format!("creating WAL directory {}", dir.display()), e))?;

        let mut found = Vec::new();
        let entries = fs::read_dir(dir)
            .map_err(|e| StorageError::io(format!("listing WAL directory {}", dir.display()), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io("listing WAL directory", e))?;
            let file_name = entry.file_name();
            if let Some(order) = WalSegment::parse_order(name, &file_name.to_string_lossy()) {
                found.push((order, entry.path()));
            }
        }
        found.sort();

        let mut segments = Vec::with_capacity(found.len() + 1);
        for (order, path) in found {
            segments.push(WalSegment::open(path, order)?);
        }

        // Only the newest records can be torn: every segment after the one
        // holding the last record is empty.
        let mut last_lsn = None;
        for segment in segments.iter_mut().rev() {
            if let Some(position) = segment.scan(true)? {
                last_lsn = Some(Lsn::new(segment.order(), position));
                break;
            }
        }

        let next_order = segments.last().map_or(1, |s| s.order() + 1);
        segments.push(WalSegment::create(dir, name, next_order)?);
        log::info!(
            "Opened WAL '{}' in {} with {} segment(s), last record {:?}",
            name,
            dir.display(),
            segments.len(),
            last_lsn
        );

        Ok(WriteAheadLog {
            master: MasterRecord::new(dir, name),
            dir: dir.to_path_buf(),
            name: name.to_string(),
            state: Mutex::new(WalState {
                segments,
                buffer: BytesMut::with_capacity(config.buffer_size),
                last_lsn,
                closed: false,
            }),
            flushed_lsn: RwLock::new(last_lsn),
            cut_till_limits: Mutex::new(BTreeMap::new()),
            config,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends a record and returns its LSN. The record is durable only once
    /// a flush covers it.
    pub fn log(&self, record: &WalRecord) -> StorageResult<Lsn> {
        let frame = encode_frame(record)?;
        let mut state = self.state.lock();
        state.check_open()?;

        if state.active_len() > 0
            && state.active_len() + frame.len() as u64 > self.config.max_segment_size
        {
            self.rotate_locked(&mut state)?;
        }

        let lsn = Lsn::new(state.active().order(), state.active_len());
        state.buffer.extend_from_slice(&frame);
        state.last_lsn = Some(lsn);

        if state.buffer.len() >= self.config.buffer_size {
            Self::write_buffer_locked(&mut state)?;
        }
        Ok(lsn)
    }

    pub fn log_atomic_operation_start(
        &self,
        unit_id: OperationUnitId,
        metadata: Option<Vec<u8>>,
    ) -> StorageResult<Lsn> {
        self.log(&WalRecord::atomic_unit_start(unit_id, metadata))
    }

    pub fn log_atomic_operation_end(&self, unit_id: OperationUnitId, rollback: bool) -> StorageResult<Lsn> {
        self.log(&WalRecord::atomic_unit_end(unit_id, rollback))
    }

    fn write_buffer_locked(state: &mut WalState) -> StorageResult<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        let pending = state.buffer.split();
        state.active_mut().append(&pending)
    }

    fn flush_locked(&self, state: &mut WalState) -> StorageResult<()> {
        Self::write_buffer_locked(state)?;
        state.active().sync()?;
        *self.flushed_lsn.write() = state.last_lsn;
        Ok(())
    }

    fn rotate_locked(&self, state: &mut WalState) -> StorageResult<u64> {
        self.flush_locked(state)?;
        let order = state.active().order() + 1;
        state.segments.push(WalSegment::create(&self.dir, &self.name, order)?);
        log::debug!("WAL '{}' switched to segment {}", self.name, order);
        Ok(order)
    }

    /// Writes out the buffer and syncs the active segment.
    pub fn flush(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        self.flush_locked(&mut state)
    }

    /// Flushes only if `lsn` is not durable yet.
    pub fn flush_until(&self, lsn: Lsn) -> StorageResult<()> {
        if self.is_flushed(lsn) {
            return Ok(());
        }
        self.flush()
    }

    pub fn is_flushed(&self, lsn: Lsn) -> bool {
        matches!(*self.flushed_lsn.read(), Some(flushed) if flushed >= lsn)
    }

    /// LSN of the last durable record.
    pub fn flushed_lsn(&self) -> Option<Lsn> {
        *self.flushed_lsn.read()
    }

    /// LSN of the last appended record.
    pub fn end(&self) -> Option<Lsn> {
        self.state.lock().last_lsn
    }

    /// LSN the next appended record would get, if no segment switch happens.
    pub fn next_lsn(&self) -> Lsn {
        let state = self.state.lock();
        Lsn::new(state.active().order(), state.active_len())
    }

    /// LSN of the oldest record still in the log.
    pub fn begin(&self) -> StorageResult<Option<Lsn>> {
        let mut state = self.state.lock();
        Self::write_buffer_locked(&mut state)?;
        Ok(state
            .segments
            .iter()
            .find(|s| !s.is_empty())
            .map(|s| Lsn::new(s.order(), 0)))
    }

    /// Reads the record at `lsn`. `Ok(None)` if no record starts there.
    pub fn read(&self, lsn: Lsn) -> StorageResult<Option<WalRecord>> {
        let mut state = self.state.lock();
        Self::write_buffer_locked(&mut state)?;
        let segment = match state.segment(lsn.segment) {
            Some(segment) => segment,
            None => return Ok(None),
        };
        match segment.read_frame(lsn.position)? {
            None => Ok(None),
            Some(Frame::Record { record, .. }) => Ok(Some(record)),
            Some(Frame::Torn(reason)) => Err(segment.torn(lsn.position, &reason)),
        }
    }

    /// LSN of the record following the one at `lsn`.
    pub fn next(&self, lsn: Lsn) -> StorageResult<Option<Lsn>> {
        let mut state = self.state.lock();
        Self::write_buffer_locked(&mut state)?;
        let segment = match state.segment(lsn.segment) {
            Some(segment) => segment,
            None => return Ok(None),
        };
        let size = match segment.frame_size_at(lsn.position)? {
            Some(size) => size,
            None => return Ok(None),
        };
        let position = lsn.position + size;
        if position < segment.size() {
            return Ok(Some(Lsn::new(lsn.segment, position)));
        }
        Ok(state
            .segments
            .iter()
            .find(|s| s.order() > lsn.segment && !s.is_empty())
            .map(|s| Lsn::new(s.order(), 0)))
    }

    /// Iterates records starting at `start`, which must be a record LSN.
    pub fn iter_from(&self, start: Lsn) -> WalIter<'_> {
        WalIter {
            wal: self,
            next: Some(start),
        }
    }

    /// Iterates every record in the log.
    pub fn iter(&self) -> StorageResult<WalIter<'_>> {
        Ok(WalIter {
            wal: self,
            next: self.begin()?,
        })
    }

    /// Removes segments whose records all precede `lsn`, never going past
    /// the lowest registered cut-till limit nor touching the active segment.
    /// Returns the number of removed segments.
    pub fn cut_till(&self, lsn: Lsn) -> StorageResult<usize> {
        let limit = match self.cut_till_limits.lock().keys().next() {
            Some(&lowest) => lowest.min(lsn),
            None => lsn,
        };
        self.cut_segments_below(limit.segment)
    }

    /// Removes every segment with an order lower than `order`, subject to the
    /// same limits as [`cut_till`](Self::cut_till).
    pub fn cut_all_segments_smaller_than(&self, order: u64) -> StorageResult<usize> {
        let order = match self.cut_till_limits.lock().keys().next() {
            Some(lowest) => lowest.segment.min(order),
            None => order,
        };
        self.cut_segments_below(order)
    }

    fn cut_segments_below(&self, order: u64) -> StorageResult<usize> {
        let mut state = self.state.lock();
        state.check_open()?;
        self.flush_locked(&mut state)?;

        let active = state.active().order();
        let keep_from = state
            .segments
            .iter()
            .position(|s| s.order() >= order || s.order() == active)
            .unwrap_or(state.segments.len() - 1);
        let removed: Vec<WalSegment> = state.segments.drain(..keep_from).collect();
        let count = removed.len();
        for segment in removed {
            log::debug!("Removing WAL segment {}", segment.order());
            segment.remove()?;
        }
        Ok(count)
    }

    /// Protects the segments holding `lsn` and later from being cut.
    pub fn add_cut_till_limit(&self, lsn: Lsn) {
        *self.cut_till_limits.lock().entry(lsn).or_insert(0) += 1;
    }

    pub fn remove_cut_till_limit(&self, lsn: Lsn) -> StorageResult<()> {
        let mut limits = self.cut_till_limits.lock();
        match limits.get_mut(&lsn) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                limits.remove(&lsn);
            }
            None => {
                return Err(StorageError::InvalidState(format!(
                    "no cut-till limit registered at {}",
                    lsn
                )))
            }
        }
        Ok(())
    }

    /// Closes the active segment and starts a new one. Returns its order.
    pub fn append_new_segment(&self) -> StorageResult<u64> {
        let mut state = self.state.lock();
        state.check_open()?;
        self.rotate_locked(&mut state)
    }

    /// Makes sure every future LSN is greater than `lsn`.
    pub fn move_lsn_after(&self, lsn: Lsn) -> StorageResult<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        if lsn.segment < state.active().order() {
            return Ok(());
        }
        self.flush_locked(&mut state)?;
        let order = lsn.segment + 1;
        state.segments.push(WalSegment::create(&self.dir, &self.name, order)?);
        log::debug!("WAL '{}' moved past {} into segment {}", self.name, lsn, order);
        Ok(())
    }

    pub fn active_segment(&self) -> u64 {
        self.state.lock().active().order()
    }

    /// Orders and paths of every segment, oldest first.
    pub fn segments(&self) -> StorageResult<Vec<(u64, PathBuf)>> {
        let mut state = self.state.lock();
        Self::write_buffer_locked(&mut state)?;
        Ok(state
            .segments
            .iter()
            .map(|s| (s.order(), s.path().to_path_buf()))
            .collect())
    }

    /// Total size of the log in bytes, buffered frames included.
    pub fn size(&self) -> u64 {
        let state = self.state.lock();
        state.segments.iter().map(WalSegment::size).sum::<u64>() + state.buffer.len() as u64
    }

    /// Records `checkpoint` as the start of the last completed checkpoint.
    pub fn write_master_record(&self, checkpoint: Lsn) -> StorageResult<()> {
        self.master.write(checkpoint)
    }

    pub fn last_checkpoint(&self) -> StorageResult<Option<Lsn>> {
        self.master.read()
    }

    /// Flushes everything and refuses further appends.
    pub fn close(&self) -> StorageResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        self.flush_locked(&mut state)?;
        state.closed = true;
        log::info!("Closed WAL '{}'", self.name);
        Ok(())
    }

    /// Closes the log and removes all of its files.
    pub fn delete(self) -> StorageResult<()> {
        let state = self.state.into_inner();
        for segment in state.segments {
            segment.remove()?;
        }
        self.master.remove()
    }
}

/// Iterator over `(lsn, record)` pairs.
pub struct WalIter<'a> {
    wal: &'a WriteAheadLog,
    next: Option<Lsn>,
}

impl Iterator for WalIter<'_> {
    type Item = StorageResult<(Lsn, WalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        let lsn = self.next.take()?;
        let record = match self.wal.read(lsn) {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => return Some(Err(e)),
        };
        match self.wal.next(lsn) {
            Ok(next) => self.next = next,
            Err(e) => return Some(Err(e)),
        }
        Some(Ok((lsn, record)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::{FileId, PageKey};
    use tempfile::tempdir;

    fn small_config() -> WalConfig {
        WalConfig {
            max_segment_size: 16 * 1024,
            sync_on_commit: false,
            buffer_size: 4 * 1024,
        }
    }

    fn record(unit: u64) -> WalRecord {
        WalRecord::atomic_unit_start(OperationUnitId::new(unit), Some(vec![unit as u8; 64]))
    }

    #[test]
    fn test_log_and_read_back() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let wal = WriteAheadLog::open(dir.path(), "db", small_config())?;

        let lsn1 = wal.log(&record(1))?;
        let lsn2 = wal.log(&record(2))?;
        assert!(lsn1 < lsn2);
        assert_eq!(wal.end(), Some(lsn2));

        assert_eq!(wal.read(lsn1)?, Some(record(1)));
        assert_eq!(wal.read(lsn2)?, Some(record(2)));
        assert_eq!(wal.next(lsn1)?, Some(lsn2));
        assert_eq!(wal.next(lsn2)?, None);
        assert_eq!(wal.begin()?, Some(lsn1));
        Ok(())
    }

    #[test]
    fn test_flushed_lsn_advances_on_flush() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let wal = WriteAheadLog::open(dir.path(), "db", small_config())?;
        assert_eq!(wal.flushed_lsn(), None);

        let lsn = wal.log(&record(1))?;
        assert!(!wal.is_flushed(lsn));

        wal.flush_until(lsn)?;
        assert!(wal.is_flushed(lsn));
        assert_eq!(wal.flushed_lsn(), Some(lsn));
        Ok(())
    }

    #[test]
    fn test_segment_rotation() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let wal = WriteAheadLog::open(dir.path(), "db", small_config())?;

        let lsns: Vec<Lsn> = (0..500).map(|i| wal.log(&record(i))).collect::<Result<_, _>>()?;
        assert!(wal.active_segment() > 1);
        assert!(lsns.windows(2).all(|w| w[0] < w[1]));

        let replayed: Vec<Lsn> = wal
            .iter()?
            .map(|item| item.map(|(lsn, _)| lsn))
            .collect::<Result<_, _>>()?;
        assert_eq!(replayed, lsns);
        Ok(())
    }

    #[test]
    fn test_reopen_continues_in_new_segment() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let last = {
            let wal = WriteAheadLog::open(dir.path(), "db", small_config())?;
            wal.log(&record(1))?;
            let last = wal.log(&record(2))?;
            wal.close()?;
            last
        };

        let wal = WriteAheadLog::open(dir.path(), "db", small_config())?;
        assert_eq!(wal.end(), Some(last));
        assert_eq!(wal.flushed_lsn(), Some(last));
        let next = wal.log(&record(3))?;
        assert_eq!(next, Lsn::new(last.segment + 1, 0));
        assert_eq!(wal.iter()?.count(), 3);
        Ok(())
    }

    #[test]
    fn test_unflushed_records_are_lost_on_reopen() -> anyhow::Result<()> {
        let dir = tempdir()?;
        {
            let wal = WriteAheadLog::open(dir.path(), "db", small_config())?;
            wal.log(&record(1))?;
            wal.flush()?;
            wal.log(&record(2))?;
        }
        let wal = WriteAheadLog::open(dir.path(), "db", small_config())?;
        assert_eq!(wal.iter()?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_cut_till_respects_limits() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let wal = WriteAheadLog::open(dir.path(), "db", small_config())?;

        for i in 0..600 {
            wal.log(&record(i))?;
        }
        let end = wal.end().unwrap();
        assert!(end.segment >= 3);

        let limit = Lsn::new(2, 0);
        wal.add_cut_till_limit(limit);
        wal.cut_till(end)?;
        assert_eq!(wal.begin()?, Some(Lsn::new(2, 0)));

        wal.remove_cut_till_limit(limit)?;
        assert!(wal.remove_cut_till_limit(limit).is_err());
        wal.cut_till(end)?;
        assert_eq!(wal.begin()?, Some(Lsn::new(end.segment, 0)));
        assert_eq!(wal.read(end)?, Some(record(599)));
        Ok(())
    }

    #[test]
    fn test_cut_never_removes_active_segment() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let wal = WriteAheadLog::open(dir.path(), "db", small_config())?;
        let lsn = wal.log(&record(1))?;
        wal.cut_all_segments_smaller_than(u64::MAX)?;
        assert_eq!(wal.read(lsn)?, Some(record(1)));
        Ok(())
    }

    #[test]
    fn test_move_lsn_after() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let wal = WriteAheadLog::open(dir.path(), "db", small_config())?;
        wal.log(&record(1))?;

        wal.move_lsn_after(Lsn::new(40, 100))?;
        let lsn = wal.log(&record(2))?;
        assert!(lsn > Lsn::new(40, 100));

        let order = wal.append_new_segment()?;
        assert_eq!(order, 42);
        assert_eq!(wal.log(&record(3))?, Lsn::new(42, 0));
        Ok(())
    }

    #[test]
    fn test_torn_tail_is_truncated_on_open() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (first, path) = {
            let wal = WriteAheadLog::open(dir.path(), "db", small_config())?;
            let first = wal.log(&record(1))?;
            wal.log(&record(2))?;
            wal.close()?;
            (first, dir.path().join(WalSegment::file_name("db", first.segment)))
        };

        let len = fs::metadata(&path)?.len();
        let file = fs::OpenOptions::new().write(true).open(&path)?;
        file.set_len(len - 5)?;
        drop(file);

        let wal = WriteAheadLog::open(dir.path(), "db", small_config())?;
        assert_eq!(wal.end(), Some(first));
        assert_eq!(wal.iter()?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_closed_log_refuses_appends() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let wal = WriteAheadLog::open(dir.path(), "db", small_config())?;
        wal.close()?;
        let key = PageKey::new(FileId::compose(1, 1), 0);
        assert!(matches!(
            wal.log(&WalRecord::update_page(OperationUnitId::new(1), key, None, Vec::new())),
            Err(StorageError::Closed)
        ));
        Ok(())
    }

    #[test]
    fn test_master_record() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let wal = WriteAheadLog::open(dir.path(), "db", small_config())?;
        assert_eq!(wal.last_checkpoint()?, None);
        let lsn = wal.log(&record(1))?;
        wal.write_master_record(lsn)?;
        assert_eq!(wal.last_checkpoint()?, Some(lsn));

        wal.delete()?;
        assert_eq!(fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }
}
