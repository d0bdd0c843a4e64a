//! Background page flushing and fuzzy checkpoints.
//!
//! The worker owns a dedicated thread running a current-thread tokio
//! runtime. It writes back a batch of dirty pages on every flush tick and
//! takes a fuzzy checkpoint on every checkpoint tick. Callers can ask for an
//! immediate flush or checkpoint over the command channel; the worker stops
//! on an explicit shutdown command.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};

use crate::recovery::{Checkpoint, CheckpointManager};
use crate::storage::buffer::WriteCache;
use crate::storage::error::{StorageError, StorageResult};

/// Pages written per flush tick at least.
const MIN_BATCH: usize = 32;

enum WorkerCommand {
    Flush(oneshot::Sender<StorageResult<usize>>),
    Checkpoint(oneshot::Sender<StorageResult<Checkpoint>>),
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub flush_interval: Duration,
    pub checkpoint_interval: Duration,
    /// Dirty pages left alone by a flush tick beyond the minimum batch.
    pub max_dirty_pages: usize,
}

pub struct FlushWorker {
    sender: mpsc::UnboundedSender<WorkerCommand>,
    handle: Option<JoinHandle<()>>,
}

impl FlushWorker {
    pub fn start(
        write_cache: Arc<WriteCache>,
        checkpoints: Arc<CheckpointManager>,
        config: WorkerConfig,
    ) -> StorageResult<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| StorageError::io("building the flush runtime", e))?;

        let handle = thread::Builder::new()
            .name("page-flush".to_string())
            .spawn(move || runtime.block_on(run(write_cache, checkpoints, config, receiver)))
            .map_err(|e| StorageError::io("spawning the flush thread", e))?;

        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<StorageResult<T>>) -> WorkerCommand,
    ) -> StorageResult<T> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(command(reply))
            .map_err(|_| StorageError::Closed)?;
        response.blocking_recv().map_err(|_| StorageError::Closed)?
    }

    /// Writes back every dirty page. Returns the number written.
    ///
    /// Must not be called by a thread that has an atomic operation running.
    pub fn flush(&self) -> StorageResult<usize> {
        self.request(WorkerCommand::Flush)
    }

    pub fn checkpoint(&self) -> StorageResult<Checkpoint> {
        self.request(WorkerCommand::Checkpoint)
    }

    /// Stops the worker and waits for its thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.sender.send(WorkerCommand::Shutdown);
            if handle.join().is_err() {
                log::error!("Flush worker panicked");
            }
        }
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    write_cache: Arc<WriteCache>,
    checkpoints: Arc<CheckpointManager>,
    config: WorkerConfig,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
) {
    let mut flush_tick = time::interval(config.flush_interval);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut checkpoint_tick = time::interval(config.checkpoint_interval);
    checkpoint_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Both intervals fire immediately; skip that first tick.
    flush_tick.tick().await;
    checkpoint_tick.tick().await;

    log::debug!("Flush worker started");
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(WorkerCommand::Flush(reply)) => {
                    let dirty = write_cache.dirty_pages();
                    let _ = reply.send(write_cache.flush().map(|()| dirty));
                }
                Some(WorkerCommand::Checkpoint(reply)) => {
                    let _ = reply.send(checkpoints.fuzzy_checkpoint());
                }
                Some(WorkerCommand::Shutdown) | None => break,
            },
            _ = flush_tick.tick() => {
                let dirty = write_cache.dirty_pages();
                if write_cache.is_broken() || dirty == 0 {
                    continue;
                }
                let batch = MIN_BATCH.max(dirty.saturating_sub(config.max_dirty_pages));
                match write_cache.flush_batch(batch) {
                    Ok(0) => {}
                    Ok(written) => log::debug!("Background flush wrote {} page(s)", written),
                    Err(e) => log::error!("Background flush failed: {}", e),
                }
            }
            _ = checkpoint_tick.tick() => {
                if write_cache.is_broken() {
                    continue;
                }
                if let Err(e) = checkpoints.fuzzy_checkpoint() {
                    log::error!("Fuzzy checkpoint failed: {}", e);
                }
            }
        }
    }
    log::debug!("Flush worker stopped");
}
