//! pagedb - maintenance tool for paginated storages

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use pagedb::storage::wal::WriteAheadLog;
use pagedb::{BackupOptions, PaginatedStorage, StorageConfig};

/// pagedb - inspect, recover and back up a paginated storage
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Storage directory
    #[arg(short = 'D', long, default_value = "./pagedb_data")]
    data_dir: PathBuf,

    /// Storage name, the WAL file prefix
    #[arg(short, long, default_value = "pagedb")]
    name: String,

    /// Page size in bytes
    #[arg(short, long, default_value = "8192")]
    page_size: usize,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show files, WAL segments and the last checkpoint
    Info,
    /// Print the records of the write-ahead log
    WalDump {
        /// Stop after this many records
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Open the storage, replaying the log if it was not closed cleanly
    Recover,
    /// Flush every dirty page and take a full checkpoint
    Checkpoint,
    /// Write a backup of the storage to a file
    Backup {
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Rebuild the storage from a backup file into an empty directory
    Restore {
        #[arg(short, long)]
        input: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = StorageConfig {
        name: args.name.clone(),
        page_size: args.page_size,
        ..StorageConfig::new(&args.data_dir)
    };
    config.validate().context("Invalid storage configuration")?;

    match args.command {
        Command::Info => info(config),
        Command::WalDump { limit } => wal_dump(config, limit),
        Command::Recover => recover(config),
        Command::Checkpoint => checkpoint(config),
        Command::Backup { output } => backup(config, output),
        Command::Restore { input } => restore(config, input),
    }
}

fn open(config: StorageConfig) -> Result<PaginatedStorage> {
    let path = config.path.clone();
    PaginatedStorage::open(config).with_context(|| format!("Failed to open storage at {}", path.display()))
}

fn info(config: StorageConfig) -> Result<()> {
    let storage = open(config)?;
    println!("📁 Storage: {} ({})", storage.config().name, storage.config().path.display());
    println!("   - Page size: {}", storage.config().page_size);
    println!("   - Storage id: {}", storage.config().storage_id);

    let files = storage.files();
    println!("📄 Files: {}", files.len());
    for (name, file_id) in files {
        let pages = storage.filled_up_to(file_id)?;
        println!("   - {} ({}): {} page(s)", name, file_id, pages);
    }

    let segments = storage.wal().segments()?;
    println!("📜 WAL: {} segment(s), {} byte(s)", segments.len(), storage.wal().size());
    match storage.wal().last_checkpoint()? {
        Some(lsn) => println!("   - Last checkpoint: {}", lsn),
        None => println!("   - No checkpoint yet"),
    }
    storage.close().context("Failed to close storage")?;
    Ok(())
}

fn wal_dump(config: StorageConfig, limit: Option<usize>) -> Result<()> {
    let wal = WriteAheadLog::open(&config.wal_dir(), &config.name, config.wal.clone())
        .context("Failed to open the write-ahead log")?;
    let mut count = 0;
    for entry in wal.iter()? {
        if limit.is_some_and(|limit| count >= limit) {
            break;
        }
        let (lsn, record) = entry?;
        println!("{} {:?}", lsn, record);
        count += 1;
    }
    println!("{} record(s)", count);
    wal.close()?;
    Ok(())
}

fn recover(config: StorageConfig) -> Result<()> {
    let storage = open(config)?;
    match storage.recovery_stats() {
        Some(stats) => {
            println!("🔁 Replayed from {:?} to {:?}", stats.start_lsn, stats.end_lsn);
            println!("   - Records analyzed: {}", stats.records_analyzed);
            println!(
                "   - Units redone: {}, discarded: {}, undone: {}",
                stats.units_redone, stats.units_discarded, stats.units_undone
            );
        }
        None => println!("✅ Storage was closed cleanly; nothing to recover"),
    }
    storage.close().context("Failed to close storage")?;
    Ok(())
}

fn checkpoint(config: StorageConfig) -> Result<()> {
    let storage = open(config)?;
    let checkpoint = storage.full_checkpoint().context("Checkpoint failed")?;
    println!(
        "✅ Checkpoint at {}, {} WAL segment(s) removed",
        checkpoint.start_lsn, checkpoint.segments_removed
    );
    storage.close().context("Failed to close storage")?;
    Ok(())
}

fn backup(config: StorageConfig, output: PathBuf) -> Result<()> {
    let storage = open(config)?;
    let file = File::create(&output).with_context(|| format!("Failed to create {}", output.display()))?;
    let mut writer = BufWriter::new(file);
    let stats = storage
        .backup(&mut writer, &BackupOptions::default())
        .context("Backup failed")?;
    println!(
        "✅ Backed up {} file(s), {} page(s), {} WAL segment(s) to {}",
        stats.files,
        stats.pages,
        stats.wal_segments,
        output.display()
    );
    storage.close().context("Failed to close storage")?;
    Ok(())
}

fn restore(config: StorageConfig, input: PathBuf) -> Result<()> {
    let file = File::open(&input).with_context(|| format!("Failed to open {}", input.display()))?;
    let mut reader = BufReader::new(file);
    let storage =
        PaginatedStorage::restore(config, &mut reader, &BackupOptions::default()).context("Restore failed")?;
    println!(
        "✅ Restored {} file(s) into {}",
        storage.files().len(),
        storage.config().path.display()
    );
    storage.close().context("Failed to close storage")?;
    Ok(())
}
