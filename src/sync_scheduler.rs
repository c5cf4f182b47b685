//! Process-global periodic fsync fan-out.
//!
//! The only process-wide component in the engine: every shard in `Periodic`
//! durability mode shares one `SyncScheduler` background thread, which
//! re-opens the notifying shard's files by path and fsyncs them in order
//! (key file, then each data file) so it never races the shard worker's own
//! file handles over a shared seek position.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use crate::clock::now_ms;
use crate::record::NUM_BUCKETS;

/// One pending fsync request for a shard's directory.
pub struct SyncRequest {
    pub shard_dir: PathBuf,
    pub last_sync_ms: Arc<AtomicI64>,
}

/// Handle to the running scheduler thread and the sender shards notify on.
pub struct SyncScheduler {
    sender: Option<Sender<SyncRequest>>,
    handle: Option<JoinHandle<()>>,
}

impl SyncScheduler {
    /// Spawns the scheduler thread and returns a handle plus a clonable
    /// sender that shard `StorageSet`s can post notifications to.
    pub fn spawn(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let handle = thread::spawn(move || Self::run(rx));
        Self {
            sender: Some(tx),
            handle: Some(handle),
        }
    }

    /// Returns a sender shard storage can post fsync notifications on.
    pub fn sender(&self) -> Sender<SyncRequest> {
        self.sender.as_ref().expect("scheduler not yet shut down").clone()
    }

    fn run(rx: Receiver<SyncRequest>) {
        for req in rx.iter() {
            if let Err(err) = Self::sync_shard(&req) {
                log::warn!(
                    "periodic fsync of {} failed: {err}",
                    req.shard_dir.display()
                );
                continue;
            }
            req.last_sync_ms.store(now_ms(), Ordering::Relaxed);
        }
    }

    fn sync_shard(req: &SyncRequest) -> std::io::Result<()> {
        let key_file = OpenOptions::new().read(true).open(req.shard_dir.join("keys"))?;
        key_file.sync_all()?;
        for b in 0..NUM_BUCKETS {
            let data_file = OpenOptions::new()
                .read(true)
                .open(req.shard_dir.join(format!("data_{b:02}")))?;
            data_file.sync_all()?;
        }
        Ok(())
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        // Drop our own sender first, on top of every clone the engine handed
        // out to shard storage. Once all senders are gone the channel
        // closes, `run`'s `for req in rx.iter()` drains whatever is queued
        // and returns, and the join below completes.
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
