//! `ShardWorker`: owns one shard's `StorageSet` and `Index` exclusively and
//! processes its mailbox serially on a dedicated OS thread.
//!
//! The mailbox is a bounded `crossbeam_channel`; the 100 ms TTL tick is a
//! `recv_timeout` on that same channel rather than a second thread touching
//! shard state, so there is never more than one task per shard.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::clock::{now_ms, now_nanos};
use crate::compaction;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::index::{Index, IndexEntry};
use crate::record::{bucket_for_size, bucket_size, max_value_size, KeyRecord, KEY_MAX_LEN};
use crate::storage::{shard_dir_name, StorageSet};
use crate::sync_scheduler::SyncRequest;

/// Op-code carried by a `Request`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Get,
    Set,
    Add,
    Replace,
    Cas,
    Touch,
    Delete,
    Increment,
    Decrement,
    Append,
    Prepend,
    FlushAll,
    Stats,
}

/// One message posted to a shard's mailbox. `key`/`value` are empty for
/// `FlushAll`/`Stats`; `cas_witness == 0` means "not specified" for ops other
/// than `Cas`, where it is always meaningful.
pub struct Request {
    pub op: Op,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub ttl: Duration,
    pub cas_witness: u64,
    pub delta: u64,
    pub reply: Sender<Response>,
}

/// Per-shard item/byte counters returned by `Stats`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShardStats {
    pub curr_items: u64,
    /// Sum of live value lengths.
    pub bytes: u64,
    /// Sum of live slot capacities (the optional extra metric).
    pub allocated_bytes: u64,
}

/// Reply posted back on a `Request`'s one-shot channel.
#[derive(Debug)]
pub enum Response {
    Value { value: Vec<u8>, cas: u64 },
    Cas(u64),
    Ok,
    Stats(ShardStats),
    Err(EngineError),
}

/// Which ADD/REPLACE/CAS-style precondition a write must satisfy.
#[derive(Clone, Copy)]
enum WriteMode {
    Set,
    Add,
    Replace,
    Cas(u64),
}

/// Single-threaded shard state: storage, index, and the cas counter.
pub struct ShardWorker {
    shard_index: u32,
    storage: StorageSet,
    index: Index,
    cas_counter: u64,
    default_ttl: Option<Duration>,
    max_ttl: Option<Duration>,
}

impl ShardWorker {
    /// Opens shard storage, recovers the index, and spawns the worker's
    /// dedicated thread. Returns the thread handle and the sender side of
    /// its mailbox; recovery errors surface synchronously, before the
    /// thread is ever spawned.
    pub fn spawn(
        shard_index: u32,
        config: &EngineConfig,
        sync_tx: Option<Sender<SyncRequest>>,
    ) -> Result<(JoinHandle<()>, Sender<Request>)> {
        let worker = ShardWorker::new(shard_index, config, sync_tx)?;
        let (tx, rx) = crossbeam_channel::bounded(config.mailbox_capacity);
        let handle = thread::Builder::new()
            .name(format!("tqcache-shard-{shard_index:02}"))
            .spawn(move || worker.run(rx))
            .expect("failed to spawn shard worker thread");
        Ok((handle, tx))
    }

    fn new(
        shard_index: u32,
        config: &EngineConfig,
        sync_tx: Option<Sender<SyncRequest>>,
    ) -> Result<Self> {
        let dir = config.data_dir.join(shard_dir_name(shard_index));
        let mut storage = StorageSet::open(dir, config.durability, config.sync_interval, sync_tx)?;
        let mut index = Index::new();

        let next_key_id = storage.key_record_count()?;
        let now = now_ms();
        let mut skipped = 0u64;
        for key_id in 0..next_key_id {
            let record = match storage.read_key_record(key_id) {
                Ok(record) => record,
                Err(err) => {
                    log::warn!(
                        "shard {shard_index:02}: skipping unreadable key record {key_id}: {err}"
                    );
                    skipped += 1;
                    continue;
                }
            };
            if record.expiry > 0 && record.expiry <= now {
                skipped += 1;
                continue;
            }
            let slot_idx = record.slot_idx as u64;
            let length = match storage.read_slot(record.bucket, slot_idx) {
                Ok(payload) => payload.len() as u32,
                Err(err) => {
                    log::warn!(
                        "shard {shard_index:02}: skipping key record {key_id} with unreadable slot: {err}"
                    );
                    skipped += 1;
                    continue;
                }
            };
            index.upsert(
                record.key,
                IndexEntry {
                    key_id,
                    bucket: record.bucket,
                    slot_idx,
                    length,
                    expiry: record.expiry,
                    cas: record.cas,
                },
            );
        }

        log::info!(
            "shard {shard_index:02}: recovered {} live keys, skipped {skipped}",
            index.len()
        );

        Ok(Self {
            shard_index,
            storage,
            index,
            cas_counter: now_nanos(),
            default_ttl: config.default_ttl,
            max_ttl: config.max_ttl,
        })
    }

    /// Serial mailbox loop: handle a request, or run the TTL tick on a
    /// 100 ms timeout, until the mailbox's last sender is dropped.
    fn run(mut self, rx: Receiver<Request>) {
        loop {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(req) => self.handle(req),
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(err) = self.run_ttl_tick() {
                        log::warn!("shard {:02}: ttl tick failed: {err}", self.shard_index);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        if let Err(err) = self.storage.sync_final() {
            log::warn!("shard {:02}: final sync failed: {err}", self.shard_index);
        }
        log::info!("shard {:02}: worker shut down", self.shard_index);
    }

    fn handle(&mut self, req: Request) {
        let response = self.dispatch(&req);
        if let Response::Err(err) = &response {
            if err.is_storage_io() {
                log::warn!("shard {:02}: operation failed: {err}", self.shard_index);
            }
        }
        // The caller may have abandoned the reply channel; that's fine, the
        // side effects above already happened and cannot be undone.
        let _ = req.reply.send(response);
    }

    fn dispatch(&mut self, req: &Request) -> Response {
        match req.op {
            Op::Get => to_response(self.get(&req.key)),
            Op::Set => to_response(self.store(&req.key, &req.value, req.ttl, WriteMode::Set)),
            Op::Add => to_response(self.store(&req.key, &req.value, req.ttl, WriteMode::Add)),
            Op::Replace => {
                to_response(self.store(&req.key, &req.value, req.ttl, WriteMode::Replace))
            }
            Op::Cas => to_response(self.store(
                &req.key,
                &req.value,
                req.ttl,
                WriteMode::Cas(req.cas_witness),
            )),
            Op::Touch => to_response(self.touch(&req.key, req.ttl)),
            Op::Delete => match self.delete(&req.key) {
                Ok(()) => Response::Ok,
                Err(err) => Response::Err(err),
            },
            Op::Increment => to_response(self.incr_decr(&req.key, req.delta, true)),
            Op::Decrement => to_response(self.incr_decr(&req.key, req.delta, false)),
            Op::Append => to_response(self.append_or_prepend(&req.key, &req.value, false)),
            Op::Prepend => to_response(self.append_or_prepend(&req.key, &req.value, true)),
            Op::FlushAll => match self.flush_all() {
                Ok(()) => Response::Ok,
                Err(err) => Response::Err(err),
            },
            Op::Stats => Response::Stats(self.stats()),
        }
    }

    fn compute_expiry(&self, ttl: Duration) -> i64 {
        let mut ttl = if ttl.is_zero() {
            self.default_ttl.unwrap_or(Duration::ZERO)
        } else {
            ttl
        };
        if let Some(max) = self.max_ttl {
            if ttl > max {
                ttl = max;
            }
        }
        if ttl.is_zero() {
            0
        } else {
            now_ms() + ttl.as_millis() as i64
        }
    }

    fn next_cas(&mut self) -> u64 {
        let now = now_nanos();
        self.cas_counter = (self.cas_counter + 1).max(now);
        self.cas_counter
    }

    fn get(&mut self, key: &[u8]) -> Result<(Vec<u8>, u64)> {
        let now = now_ms();
        let entry = self
            .index
            .get(key)
            .cloned()
            .ok_or(EngineError::KeyNotFound)?;
        if entry.expiry > 0 && entry.expiry <= now {
            compaction::destroy(&mut self.storage, &mut self.index, key)?;
            self.storage.note_mutation(Some(entry.bucket))?;
            return Err(EngineError::KeyNotFound);
        }
        let value = self.storage.read_slot(entry.bucket, entry.slot_idx)?;
        Ok((value, entry.cas))
    }

    fn store(&mut self, key: &[u8], value: &[u8], ttl: Duration, mode: WriteMode) -> Result<u64> {
        if key.len() > KEY_MAX_LEN {
            return Err(EngineError::KeyTooLarge);
        }
        bucket_for_size(value.len())?;
        let existing = self.index.get(key).cloned();

        match mode {
            WriteMode::Add if existing.is_some() => return Err(EngineError::KeyExists),
            WriteMode::Replace if existing.is_none() => return Err(EngineError::KeyNotFound),
            WriteMode::Cas(witness) => {
                let entry = existing.as_ref().ok_or(EngineError::KeyNotFound)?;
                if entry.cas != witness {
                    return Err(EngineError::CasMismatch);
                }
            }
            _ => {}
        }

        let expiry = self.compute_expiry(ttl);
        let cas = self.next_cas();

        match existing {
            Some(entry) => self.rewrite_value(key, &entry, value, expiry, cas)?,
            None => {
                let bucket = bucket_for_size(value.len())?;
                let key_id = self.storage.key_record_count()?;
                let slot_idx = self.storage.slot_count(bucket)?;
                self.storage.write_slot(bucket, slot_idx, value)?;
                let record = KeyRecord {
                    key: key.to_vec(),
                    cas,
                    expiry,
                    bucket,
                    slot_idx: slot_idx as i64,
                };
                self.storage.write_key_record(key_id, &record)?;
                self.index.upsert(
                    key.to_vec(),
                    IndexEntry {
                        key_id,
                        bucket,
                        slot_idx,
                        length: value.len() as u32,
                        expiry,
                        cas,
                    },
                );
                self.storage.note_mutation(Some(bucket))?;
            }
        }
        Ok(cas)
    }

    fn touch(&mut self, key: &[u8], ttl: Duration) -> Result<u64> {
        let entry = self
            .index
            .get(key)
            .cloned()
            .ok_or(EngineError::KeyNotFound)?;
        let expiry = self.compute_expiry(ttl);
        let record = KeyRecord {
            key: key.to_vec(),
            cas: entry.cas,
            expiry,
            bucket: entry.bucket,
            slot_idx: entry.slot_idx as i64,
        };
        self.storage.write_key_record(entry.key_id, &record)?;
        if let Some(live) = self.index.get_mut(key) {
            live.expiry = expiry;
        }
        if expiry > 0 {
            self.index.heap.insert_or_update(entry.key_id, expiry);
        } else {
            self.index.heap.remove(entry.key_id);
        }
        self.storage.note_key_mutation()?;
        Ok(entry.cas)
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        let entry = self
            .index
            .get(key)
            .cloned()
            .ok_or(EngineError::KeyNotFound)?;
        compaction::destroy(&mut self.storage, &mut self.index, key)?;
        self.storage.note_mutation(Some(entry.bucket))?;
        Ok(())
    }

    fn incr_decr(&mut self, key: &[u8], delta: u64, increment: bool) -> Result<(Vec<u8>, u64)> {
        let entry = self
            .index
            .get(key)
            .cloned()
            .ok_or(EngineError::KeyNotFound)?;
        let raw = self.storage.read_slot(entry.bucket, entry.slot_idx)?;
        if raw.is_empty() || !raw.iter().all(u8::is_ascii_digit) {
            return Err(EngineError::NotNumeric);
        }
        let text = std::str::from_utf8(&raw).map_err(|_| EngineError::NotNumeric)?;
        let current: u64 = text.parse().map_err(|_| EngineError::NotNumeric)?;
        let updated = if increment {
            current.wrapping_add(delta)
        } else {
            current.saturating_sub(delta)
        };
        let new_value = updated.to_string().into_bytes();
        let cas = self.next_cas();
        self.rewrite_value(key, &entry, &new_value, entry.expiry, cas)?;
        Ok((new_value, cas))
    }

    fn append_or_prepend(&mut self, key: &[u8], chunk: &[u8], prepend: bool) -> Result<u64> {
        let entry = self
            .index
            .get(key)
            .cloned()
            .ok_or(EngineError::KeyNotFound)?;
        let current = self.storage.read_slot(entry.bucket, entry.slot_idx)?;
        if current.len() + chunk.len() > max_value_size() {
            return Err(EngineError::ValueTooLarge);
        }
        let mut new_value = Vec::with_capacity(current.len() + chunk.len());
        if prepend {
            new_value.extend_from_slice(chunk);
            new_value.extend_from_slice(&current);
        } else {
            new_value.extend_from_slice(&current);
            new_value.extend_from_slice(chunk);
        }
        let cas = self.next_cas();
        self.rewrite_value(key, &entry, &new_value, entry.expiry, cas)?;
        Ok(cas)
    }

    /// Writes `new_value` for an already-live `entry`, overwriting its slot
    /// in place when the bucket is unchanged or relocating to a freshly
    /// appended slot (and compacting the old one away) when it grows or
    /// shrinks across a bucket boundary. `key_id` is always preserved.
    fn rewrite_value(
        &mut self,
        key: &[u8],
        entry: &IndexEntry,
        new_value: &[u8],
        new_expiry: i64,
        cas: u64,
    ) -> Result<()> {
        let new_bucket = bucket_for_size(new_value.len())?;
        let slot_idx = if new_bucket == entry.bucket {
            self.storage.write_slot(new_bucket, entry.slot_idx, new_value)?;
            entry.slot_idx
        } else {
            self.index.forget_slot(entry.bucket, entry.slot_idx);
            let new_slot_idx = self.storage.slot_count(new_bucket)?;
            self.storage.write_slot(new_bucket, new_slot_idx, new_value)?;
            new_slot_idx
        };

        let record = KeyRecord {
            key: key.to_vec(),
            cas,
            expiry: new_expiry,
            bucket: new_bucket,
            slot_idx: slot_idx as i64,
        };
        self.storage.write_key_record(entry.key_id, &record)?;
        self.index.upsert(
            key.to_vec(),
            IndexEntry {
                key_id: entry.key_id,
                bucket: new_bucket,
                slot_idx,
                length: new_value.len() as u32,
                expiry: new_expiry,
                cas,
            },
        );

        if new_bucket != entry.bucket {
            compaction::compact_data_slot(&mut self.storage, &mut self.index, entry.bucket, entry.slot_idx)?;
            self.storage.note_mutation(Some(entry.bucket))?;
        }
        self.storage.note_mutation(Some(new_bucket))?;
        Ok(())
    }

    fn flush_all(&mut self) -> Result<()> {
        self.index.clear();
        self.storage.truncate_all()?;
        self.storage.note_flush()?;
        Ok(())
    }

    fn stats(&self) -> ShardStats {
        let mut stats = ShardStats::default();
        for (_, entry) in self.index.iter() {
            stats.curr_items += 1;
            stats.bytes += entry.length as u64;
            stats.allocated_bytes += bucket_size(entry.bucket) as u64;
        }
        stats
    }

    fn run_ttl_tick(&mut self) -> Result<()> {
        let now = now_ms();
        loop {
            let Some((expiry, key_id)) = self.index.heap.peek_min() else {
                break;
            };
            if expiry <= 0 || expiry > now {
                break;
            }
            let Some(key) = self.index.key_by_key_id(key_id) else {
                // Heap and reverse map disagree; drop the stale heap entry
                // defensively rather than loop forever.
                self.index.heap.remove(key_id);
                continue;
            };
            compaction::destroy(&mut self.storage, &mut self.index, &key)?;
            log::debug!("shard {:02}: ttl-expired key_id={key_id}", self.shard_index);
        }
        Ok(())
    }
}

fn to_response<T: IntoValueResponse>(result: Result<T>) -> Response {
    match result {
        Ok(value) => value.into_response(),
        Err(err) => Response::Err(err),
    }
}

/// Lets `dispatch` share one `Result<T> -> Response` conversion helper
/// across ops whose success payload differs (bare cas vs. value+cas).
trait IntoValueResponse {
    fn into_response(self) -> Response;
}

impl IntoValueResponse for u64 {
    fn into_response(self) -> Response {
        Response::Cas(self)
    }
}

impl IntoValueResponse for (Vec<u8>, u64) {
    fn into_response(self) -> Response {
        Response::Value {
            value: self.0,
            cas: self.1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Durability, EngineConfig};
    use tempfile::tempdir;

    fn worker(dir: &std::path::Path) -> ShardWorker {
        let config = EngineConfig::builder(dir)
            .durability(Durability::None)
            .build();
        ShardWorker::new(0, &config, None).unwrap()
    }

    #[test]
    fn set_then_get_round_trips_and_bumps_cas() {
        let dir = tempdir().unwrap();
        let mut w = worker(dir.path());
        let c1 = w.store(b"k", b"v1", Duration::ZERO, WriteMode::Set).unwrap();
        let (v, c1_read) = w.get(b"k").unwrap();
        assert_eq!(v, b"v1");
        assert_eq!(c1_read, c1);

        let c2 = w.store(b"k", b"v2", Duration::ZERO, WriteMode::Set).unwrap();
        assert!(c2 > c1);
        let (v2, c2_read) = w.get(b"k").unwrap();
        assert_eq!(v2, b"v2");
        assert_eq!(c2_read, c2);
    }

    #[test]
    fn add_rejects_existing_key() {
        let dir = tempdir().unwrap();
        let mut w = worker(dir.path());
        w.store(b"k", b"v1", Duration::ZERO, WriteMode::Set).unwrap();
        let err = w.store(b"k", b"v2", Duration::ZERO, WriteMode::Add).unwrap_err();
        assert!(matches!(err, EngineError::KeyExists));
    }

    #[test]
    fn replace_rejects_missing_key() {
        let dir = tempdir().unwrap();
        let mut w = worker(dir.path());
        let err = w
            .store(b"k", b"v2", Duration::ZERO, WriteMode::Replace)
            .unwrap_err();
        assert!(matches!(err, EngineError::KeyNotFound));
    }

    #[test]
    fn cas_rejects_stale_witness() {
        let dir = tempdir().unwrap();
        let mut w = worker(dir.path());
        let c1 = w.store(b"k", b"a", Duration::ZERO, WriteMode::Set).unwrap();
        w.store(b"k", b"b", Duration::ZERO, WriteMode::Set).unwrap();
        let err = w
            .store(b"k", b"c", Duration::ZERO, WriteMode::Cas(c1))
            .unwrap_err();
        assert!(matches!(err, EngineError::CasMismatch));
        let (v, _) = w.get(b"k").unwrap();
        assert_eq!(v, b"b");
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut w = worker(dir.path());
        w.store(b"k", b"v", Duration::ZERO, WriteMode::Set).unwrap();
        w.delete(b"k").unwrap();
        assert!(matches!(w.delete(b"k").unwrap_err(), EngineError::KeyNotFound));
        assert!(matches!(w.get(b"k").unwrap_err(), EngineError::KeyNotFound));
    }

    #[test]
    fn incr_decr_apply_wrap_and_floor_semantics() {
        let dir = tempdir().unwrap();
        let mut w = worker(dir.path());
        w.store(b"n", b"10", Duration::ZERO, WriteMode::Set).unwrap();
        let (v, _) = w.incr_decr(b"n", 5, true).unwrap();
        assert_eq!(v, b"15");
        let (v, _) = w.incr_decr(b"n", 100, false).unwrap();
        assert_eq!(v, b"0");
        let err = w.incr_decr(b"missing", 1, true).unwrap_err();
        assert!(matches!(err, EngineError::KeyNotFound));

        w.store(b"s", b"abc", Duration::ZERO, WriteMode::Set).unwrap();
        assert!(matches!(
            w.incr_decr(b"s", 1, true).unwrap_err(),
            EngineError::NotNumeric
        ));
    }

    #[test]
    fn append_promotes_bucket_and_preserves_content() {
        let dir = tempdir().unwrap();
        let mut w = worker(dir.path());
        let value = vec![b'A'; 900];
        w.store(b"k", &value, Duration::ZERO, WriteMode::Set).unwrap();
        let entry_before = w.index.get(b"k").unwrap().clone();
        assert_eq!(entry_before.bucket, 0);

        w.append_or_prepend(b"k", &vec![b'B'; 500], false).unwrap();
        let entry_after = w.index.get(b"k").unwrap().clone();
        assert_eq!(entry_after.bucket, 1);
        assert_eq!(w.storage.slot_count(0).unwrap(), 0);
        assert_eq!(w.storage.slot_count(1).unwrap(), 1);

        let (v, _) = w.get(b"k").unwrap();
        assert_eq!(v.len(), 1400);
        assert!(v[..900].iter().all(|&b| b == b'A'));
        assert!(v[900..].iter().all(|&b| b == b'B'));
    }

    #[test]
    fn touch_updates_expiry_without_changing_cas() {
        let dir = tempdir().unwrap();
        let mut w = worker(dir.path());
        let cas = w.store(b"k", b"v", Duration::ZERO, WriteMode::Set).unwrap();
        let touched_cas = w.touch(b"k", Duration::from_secs(60)).unwrap();
        assert_eq!(cas, touched_cas);
        assert!(w.index.get(b"k").unwrap().expiry > 0);
    }

    #[test]
    fn ttl_tick_expires_only_due_entries() {
        let dir = tempdir().unwrap();
        let mut w = worker(dir.path());
        w.store(b"a", b"x", Duration::from_millis(1), WriteMode::Set).unwrap();
        w.store(b"b", b"y", Duration::ZERO, WriteMode::Set).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        w.run_ttl_tick().unwrap();
        assert!(w.index.get(b"a").is_none());
        assert!(w.index.get(b"b").is_some());
    }

    #[test]
    fn stats_reports_live_items_and_bytes() {
        let dir = tempdir().unwrap();
        let mut w = worker(dir.path());
        w.store(b"a", b"1234", Duration::ZERO, WriteMode::Set).unwrap();
        w.store(b"b", b"12345678", Duration::ZERO, WriteMode::Set).unwrap();
        let stats = w.stats();
        assert_eq!(stats.curr_items, 2);
        assert_eq!(stats.bytes, 12);
    }

    #[test]
    fn flush_all_clears_everything() {
        let dir = tempdir().unwrap();
        let mut w = worker(dir.path());
        w.store(b"a", b"1", Duration::ZERO, WriteMode::Set).unwrap();
        w.store(b"b", b"2", Duration::ZERO, WriteMode::Set).unwrap();
        w.flush_all().unwrap();
        assert!(w.index.is_empty());
        assert_eq!(w.storage.key_record_count().unwrap(), 0);
        assert_eq!(w.storage.slot_count(0).unwrap(), 0);
    }
}
