//! Per-shard fixed-record files: one key file, 16 size-bucketed data files.
//!
//! All I/O is by absolute offset (`Seek` + `read_exact`/`write_all`); there is
//! no cursor state and no buffering, so a write is visible to any other file
//! handle on the same path as soon as it returns (a plain `fsync` from the
//! `SyncScheduler`'s own handle is then enough to make it durable).

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::clock::now_ms;
use crate::config::Durability;
use crate::error::Result;
use crate::record::{bucket_size, slot_size, KeyRecord, KEY_RECORD_SIZE, NUM_BUCKETS};
use crate::sync_scheduler::SyncRequest;

/// Returns the on-disk directory name for shard `index`, e.g. `shard_00`.
pub fn shard_dir_name(index: u32) -> String {
    format!("shard_{index:02}")
}

/// Owns a shard's key file and its 16 data-bucket files for the shard's
/// lifetime, plus the bookkeeping needed to decide when to fsync them.
pub struct StorageSet {
    dir: PathBuf,
    key_file: File,
    data_files: Vec<File>,
    durability: Durability,
    sync_interval: Duration,
    last_sync_ms: Arc<AtomicI64>,
    sync_tx: Option<Sender<SyncRequest>>,
}

impl StorageSet {
    /// Opens (creating if needed) the key file and all 16 data files under
    /// `dir`. `sync_tx` is required when `durability` is `Periodic`.
    pub fn open(
        dir: impl AsRef<Path>,
        durability: Durability,
        sync_interval: Duration,
        sync_tx: Option<Sender<SyncRequest>>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let key_file = open_rw(&dir.join("keys"))?;
        let mut data_files = Vec::with_capacity(NUM_BUCKETS as usize);
        for b in 0..NUM_BUCKETS {
            data_files.push(open_rw(&dir.join(format!("data_{b:02}")))?);
        }

        Ok(Self {
            dir,
            key_file,
            data_files,
            durability,
            sync_interval,
            last_sync_ms: Arc::new(AtomicI64::new(now_ms())),
            sync_tx,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of whole `KeyRecord`s currently in the key file.
    pub fn key_record_count(&self) -> Result<u64> {
        Ok(self.key_file.metadata()?.len() / KEY_RECORD_SIZE as u64)
    }

    /// Number of whole slots currently in bucket `b`'s data file.
    pub fn slot_count(&self, bucket: u8) -> Result<u64> {
        let size = self.data_files[bucket as usize].metadata()?.len();
        Ok(size / slot_size(bucket) as u64)
    }

    pub fn read_key_record(&mut self, key_id: u64) -> Result<KeyRecord> {
        let mut buf = [0u8; KEY_RECORD_SIZE];
        self.key_file
            .seek(SeekFrom::Start(key_id * KEY_RECORD_SIZE as u64))?;
        self.key_file.read_exact(&mut buf)?;
        KeyRecord::decode(&buf)
    }

    pub fn write_key_record(&mut self, key_id: u64, record: &KeyRecord) -> Result<()> {
        let buf = record.encode()?;
        self.key_file
            .seek(SeekFrom::Start(key_id * KEY_RECORD_SIZE as u64))?;
        self.key_file.write_all(&buf)?;
        Ok(())
    }

    pub fn truncate_keys(&mut self, new_count: u64) -> Result<()> {
        self.key_file.set_len(new_count * KEY_RECORD_SIZE as u64)?;
        Ok(())
    }

    /// Reads the value payload stored at `slot_idx` in bucket `b`.
    pub fn read_slot(&mut self, bucket: u8, slot_idx: u64) -> Result<Vec<u8>> {
        let size = slot_size(bucket);
        let mut buf = vec![0u8; size];
        let file = &mut self.data_files[bucket as usize];
        file.seek(SeekFrom::Start(slot_idx * size as u64))?;
        file.read_exact(&mut buf)?;
        let length = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        let length = length.min(bucket_size(bucket));
        Ok(buf[4..4 + length].to_vec())
    }

    /// Writes `payload` into slot `slot_idx` of bucket `b`, zero-padding the
    /// unused tail of the slot so the file always grows in whole-slot steps.
    pub fn write_slot(&mut self, bucket: u8, slot_idx: u64, payload: &[u8]) -> Result<()> {
        let size = slot_size(bucket);
        let mut buf = vec![0u8; size];
        buf[0..4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        buf[4..4 + payload.len()].copy_from_slice(payload);
        let file = &mut self.data_files[bucket as usize];
        file.seek(SeekFrom::Start(slot_idx * size as u64))?;
        file.write_all(&buf)?;
        Ok(())
    }

    pub fn truncate_data(&mut self, bucket: u8, new_count: u64) -> Result<()> {
        self.data_files[bucket as usize].set_len(new_count * slot_size(bucket) as u64)?;
        Ok(())
    }

    pub fn truncate_all(&mut self) -> Result<()> {
        self.key_file.set_len(0)?;
        for file in &mut self.data_files {
            file.set_len(0)?;
        }
        Ok(())
    }

    /// Call after a mutation that only touched the key file (e.g. `TOUCH`).
    pub fn note_key_mutation(&mut self) -> Result<()> {
        self.note_mutation(None)
    }

    /// Call after a mutation that touched the key file and bucket `bucket`'s
    /// data file (the common case: every value write also updates cas).
    pub fn note_mutation(&mut self, bucket: Option<u8>) -> Result<()> {
        match self.durability {
            Durability::None => Ok(()),
            Durability::Always => {
                self.key_file.sync_all()?;
                if let Some(b) = bucket {
                    self.data_files[b as usize].sync_all()?;
                }
                Ok(())
            }
            Durability::Periodic => {
                self.maybe_notify_scheduler();
                Ok(())
            }
        }
    }

    /// Call after `FLUSH_ALL`, which touches every file in the shard.
    pub fn note_flush(&mut self) -> Result<()> {
        match self.durability {
            Durability::None => Ok(()),
            Durability::Always => {
                self.key_file.sync_all()?;
                for file in &mut self.data_files {
                    file.sync_all()?;
                }
                Ok(())
            }
            Durability::Periodic => {
                self.maybe_notify_scheduler();
                Ok(())
            }
        }
    }

    /// Performs one final, synchronous fsync pass over every file, used on
    /// cooperative shutdown regardless of durability mode (except `None`).
    pub fn sync_final(&mut self) -> Result<()> {
        if matches!(self.durability, Durability::None) {
            return Ok(());
        }
        self.key_file.sync_all()?;
        for file in &mut self.data_files {
            file.sync_all()?;
        }
        self.last_sync_ms.store(now_ms(), Ordering::Relaxed);
        Ok(())
    }

    fn maybe_notify_scheduler(&mut self) {
        let now = now_ms();
        let last = self.last_sync_ms.load(Ordering::Relaxed);
        if now - last < self.sync_interval.as_millis() as i64 {
            return;
        }
        if let Some(tx) = &self.sync_tx {
            // Best-effort: dropping a notification when one is already
            // pending is safe, the scheduler drains on its next pass.
            let _ = tx.try_send(SyncRequest {
                shard_dir: self.dir.clone(),
                last_sync_ms: Arc::clone(&self.last_sync_ms),
            });
        }
    }
}

fn open_rw(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?)
}
