use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pagedb::storage::page::{layout, PageKey};
use pagedb::storage::wal::CheckpointKind;
use pagedb::{BackupOptions, PaginatedStorage, StorageConfig, StorageError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

const PAGE_SIZE: usize = 4096;

fn config(path: &Path) -> StorageConfig {
    let mut config = StorageConfig {
        page_size: PAGE_SIZE,
        cache_size: 64 * PAGE_SIZE,
        flush_interval_ms: 3_600_000,
        checkpoint_interval_ms: 3_600_000,
        ..StorageConfig::new(path)
    };
    config.wal.max_segment_size = 64 * 1024;
    config
}

#[test]
fn test_committed_page_survives_crash() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let file = {
        let storage = PaginatedStorage::open(config(dir.path()))?;
        let mut session = storage.session();
        session.begin()?;
        let file = session.add_file("t.dat")?;
        let index = session.allocate_page(file)?;
        assert_eq!(index, 0);
        session.update_page(file, index, |page| page.set_int(8, 42))?;
        session.commit()?;
        drop(session);
        storage.halt();
        file
    };

    let storage = PaginatedStorage::open(config(dir.path()))?;
    let stats = storage.recovery_stats().cloned().expect("recovery ran");
    assert_eq!(stats.units_redone, 1);
    assert_eq!(storage.open_file("t.dat")?, file);
    assert_eq!(storage.read_page(file, 0)?.view().get_int(8)?, 42);
    Ok(())
}

#[test]
fn test_torn_operation_is_rolled_back() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let file = {
        let storage = PaginatedStorage::open(config(dir.path()))?;
        let mut session = storage.session();
        let file = session.add_file("t.dat")?;
        let index = session.allocate_page(file)?;
        session.update_page(file, index, |page| page.set_int(0, 7))?;
        storage.flush()?;

        session.begin()?;
        session.update_page(file, index, |page| page.set_int(0, 1))?;
        storage.wal().flush()?;
        // Crash before the end record is written.
        std::mem::forget(session);
        storage.halt();
        file
    };

    let storage = PaginatedStorage::open(config(dir.path()))?;
    let stats = storage.recovery_stats().cloned().expect("recovery ran");
    assert_eq!(stats.units_undone, 1);
    assert_eq!(storage.read_page(file, 0)?.view().get_int(0)?, 7);
    Ok(())
}

#[test]
fn test_torn_operation_leaves_no_record_in_allocated_page() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (file, index) = {
        let storage = PaginatedStorage::open(config(dir.path()))?;
        let mut session = storage.session();
        let file = session.add_file("t.dat")?;
        storage.flush()?;

        session.begin()?;
        let index = session.create_record(file, b"UNCOMMITTED")?;
        storage.wal().flush()?;
        std::mem::forget(session);
        storage.halt();
        (file, index)
    };

    let storage = PaginatedStorage::open(config(dir.path()))?;
    let stats = storage.recovery_stats().cloned().expect("recovery ran");
    assert_eq!(stats.units_undone, 1);
    assert_eq!(storage.read_record(file, index)?, Vec::<u8>::new());
    assert!(storage.read_page(file, index)?.iter().all(|byte| *byte == 0));
    Ok(())
}

#[test]
fn test_concurrent_writers_block_on_page() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let storage = Arc::new(PaginatedStorage::open(config(dir.path()))?);
    let mut session = storage.session();
    let file = session.add_file("t.dat")?;
    let index = session.create_record(file, b"shared")?;
    drop(session);
    let key = PageKey::new(file, index);

    let released = Arc::new(AtomicBool::new(false));
    let guard = storage.read_cache().load_for_write(key)?;

    let waiter = {
        let storage = Arc::clone(&storage);
        let released = Arc::clone(&released);
        thread::spawn(move || -> anyhow::Result<bool> {
            let _guard = storage.read_cache().load_for_write(key)?;
            Ok(released.load(Ordering::SeqCst))
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!waiter.is_finished());
    released.store(true, Ordering::SeqCst);
    drop(guard);

    let saw_release = waiter.join().expect("waiter panicked")?;
    assert!(saw_release);
    Ok(())
}

#[test]
fn test_clean_pages_are_evicted_and_reloaded() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let storage = PaginatedStorage::open(StorageConfig {
        cache_size: 4 * PAGE_SIZE,
        ..config(dir.path())
    })?;
    let capacity = storage.read_cache().capacity();

    let mut session = storage.session();
    let file = session.add_file("t.dat")?;
    let mut pages = Vec::new();
    for i in 0..(capacity as u8 * 3) {
        pages.push(session.create_record(file, &[i; 64])?);
    }
    drop(session);
    storage.flush()?;
    assert_eq!(storage.write_cache().dirty_pages(), 0);

    let first = pages[0];
    for &page in &pages {
        storage.read_record(file, page)?;
    }
    assert!(storage.read_cache().len() <= capacity);
    assert!(!storage.read_cache().contains(PageKey::new(file, first)));
    assert_eq!(storage.write_cache().dirty_pages(), 0);

    assert_eq!(storage.read_record(file, first)?, vec![0u8; 64]);
    Ok(())
}

#[test]
fn test_segment_trimming_respects_unflushed_pages() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut config = config(dir.path());
    config.wal.max_segment_size = 2 * PAGE_SIZE as u64;
    let storage = PaginatedStorage::open(config)?;

    let mut session = storage.session();
    let file = session.add_file("t.dat")?;
    for i in 0..24u8 {
        session.create_record(file, &[i; 2000])?;
    }
    drop(session);
    assert!(storage.wal().segments()?.len() > 3);

    let oldest_dirty = storage.write_cache().min_dirty_lsn().expect("pages are dirty");
    let checkpoint = storage.checkpoint()?;
    assert_eq!(checkpoint.kind, CheckpointKind::Fuzzy);
    assert_eq!(checkpoint.redo_lsn, oldest_dirty);
    assert!(storage.wal().segments()?[0].0 <= oldest_dirty.segment);

    storage.flush()?;
    let checkpoint = storage.checkpoint()?;
    assert!(checkpoint.segments_removed > 0);
    assert_eq!(storage.wal().segments()?[0].0, checkpoint.redo_lsn.segment);
    Ok(())
}

#[test]
fn test_random_workload_is_crash_consistent() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut model: BTreeMap<u64, Vec<u8>> = BTreeMap::new();

    for round in 0..4 {
        let storage = PaginatedStorage::open(config(dir.path()))?;
        let mut session = storage.session();
        let file = match storage.file_id("random.dat") {
            Some(file) => file,
            None => session.add_file("random.dat")?,
        };

        for _ in 0..40 {
            let len = rng.gen_range(1..512);
            let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            match rng.gen_range(0..10) {
                0..=4 => {
                    let page = session.create_record(file, &bytes)?;
                    model.insert(page, bytes);
                }
                5..=6 if !model.is_empty() => {
                    let page = *model.keys().nth(rng.gen_range(0..model.len())).expect("non-empty");
                    session.begin()?;
                    session.update_page(file, page, |p| pagedb::storage::page::record::write_record(p, &bytes))?;
                    session.rollback()?;
                }
                7 if !model.is_empty() => {
                    let page = *model.keys().nth(rng.gen_range(0..model.len())).expect("non-empty");
                    session.update_page(file, page, |p| pagedb::storage::page::record::write_record(p, &bytes))?;
                    model.insert(page, bytes);
                }
                8 => storage.flush()?,
                _ => {
                    storage.checkpoint()?;
                }
            }
        }
        drop(session);
        if round % 2 == 0 {
            storage.halt();
        } else {
            storage.close()?;
        }
    }

    let storage = PaginatedStorage::open(config(dir.path()))?;
    let file = storage.open_file("random.dat")?;
    for (&page, bytes) in &model {
        assert_eq!(&storage.read_record(file, page)?, bytes, "page {}", page);
    }
    Ok(())
}

#[test]
fn test_replay_is_idempotent() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let (file, pages) = {
        let storage = PaginatedStorage::open(config(dir.path()))?;
        let mut session = storage.session();
        let file = session.add_file("t.dat")?;
        let pages: Vec<u64> = (0..6u8)
            .map(|i| session.create_record(file, &[i; 32]))
            .collect::<Result<_, _>>()?;
        drop(session);
        storage.halt();
        (file, pages)
    };

    for _ in 0..2 {
        let storage = PaginatedStorage::open(config(dir.path()))?;
        assert!(storage.recovery_stats().is_some());
        for (i, &page) in pages.iter().enumerate() {
            assert_eq!(storage.read_record(file, page)?, vec![i as u8; 32]);
        }
        storage.halt();
    }
    Ok(())
}

#[test]
fn test_pages_never_outrun_the_log() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let mut config = config(dir.path());
    config.wal.sync_on_commit = false;
    let storage = PaginatedStorage::open(config)?;

    let mut session = storage.session();
    let file = session.add_file("t.dat")?;
    for i in 0..10u8 {
        session.create_record(file, &[i; 100])?;
    }
    drop(session);
    storage.flush()?;

    let flushed = storage.wal().flushed_lsn().expect("log was flushed");
    let mut image = vec![0u8; PAGE_SIZE];
    for page in 0..storage.filled_up_to(file)? {
        storage
            .write_cache()
            .read_page_image(PageKey::new(file, page), &mut image)?;
        assert!(layout::page_lsn(&image) <= flushed);
    }
    Ok(())
}

#[test]
fn test_session_rules() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let storage = PaginatedStorage::open(config(dir.path()))?;
    let mut session = storage.session();

    assert!(matches!(session.commit(), Err(StorageError::NoActiveOperation)));
    assert!(matches!(session.rollback(), Err(StorageError::NoActiveOperation)));
    session.begin()?;
    assert!(matches!(session.begin(), Err(StorageError::NestedOperation)));
    session.rollback()?;

    let file = session.add_file("t.dat")?;
    let page = session.create_record(file, b"doomed")?;
    session.delete_page(file, page)?;
    assert!(matches!(
        session.read_record(file, page),
        Err(StorageError::RecordNotFound(_))
    ));
    assert!(matches!(
        session.delete_page(file, page),
        Err(StorageError::RecordNotFound(_))
    ));

    session.begin()?;
    session.delete_file(file)?;
    session.rollback()?;
    assert_eq!(storage.open_file("t.dat")?, file);

    session.delete_file(file)?;
    assert!(storage.file_id("t.dat").is_none());
    Ok(())
}

#[test]
fn test_parallel_sessions() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let storage = Arc::new(PaginatedStorage::open(config(dir.path()))?);

    let handles: Vec<_> = (0..4u8)
        .map(|t| {
            let storage = Arc::clone(&storage);
            thread::spawn(move || -> anyhow::Result<()> {
                let mut session = storage.session();
                let file = session.add_file(&format!("thread-{}.dat", t))?;
                for i in 0..20u8 {
                    let page = session.create_record(file, &[t, i])?;
                    assert_eq!(session.read_record(file, page)?, vec![t, i]);
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer panicked")?;
    }

    assert_eq!(storage.files().len(), 4);
    for (_, file) in storage.files() {
        assert_eq!(storage.filled_up_to(file)?, 20);
    }
    Ok(())
}

#[test]
fn test_background_flush_writes_back_dirty_pages() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let storage = PaginatedStorage::open(StorageConfig {
        flush_interval_ms: 20,
        max_dirty_pages: 0,
        ..config(dir.path())
    })?;

    let mut session = storage.session();
    let file = session.add_file("t.dat")?;
    for i in 0..8u8 {
        session.create_record(file, &[i; 16])?;
    }
    drop(session);

    let deadline = Instant::now() + Duration::from_secs(5);
    while storage.write_cache().dirty_pages() > 0 {
        assert!(Instant::now() < deadline, "background flush did not run");
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

#[test]
fn test_backup_of_running_storage() -> anyhow::Result<()> {
    let source = tempdir()?;
    let storage = Arc::new(PaginatedStorage::open(config(source.path()))?);
    let mut session = storage.session();
    let file = session.add_file("t.dat")?;
    for i in 0..10u8 {
        session.create_record(file, &[i; 10])?;
    }
    drop(session);

    let writer = {
        let storage = Arc::clone(&storage);
        thread::spawn(move || -> anyhow::Result<()> {
            let mut session = storage.session();
            for i in 10..30u8 {
                session.create_record(file, &[i; 10])?;
            }
            Ok(())
        })
    };
    let mut stream = Vec::new();
    let stats = storage.backup(&mut stream, &BackupOptions::default())?;
    writer.join().expect("writer panicked")?;

    let target = tempdir()?;
    let restored = PaginatedStorage::restore(
        config(&target.path().join("copy")),
        &mut stream.as_slice(),
        &BackupOptions::default(),
    )?;
    // Every page in the backup is a complete record.
    assert_eq!(restored.filled_up_to(file)?, stats.pages);
    for page in 0..stats.pages {
        assert_eq!(restored.read_record(file, page)?, vec![page as u8; 10]);
    }
    Ok(())
}
