//! `Engine`: owns every shard worker thread plus the process-global
//! `SyncScheduler`, and exposes the semantic request surface (`Get`, `Set`,
//! `Add`, ...) that a protocol collaborator would drive.

use std::io;
use std::path::Path;
use std::process;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;

use crate::clock::now_ms;
use crate::config::{Durability, EngineConfig};
use crate::error::{EngineError, Result};
use crate::router::shard_for_key;
use crate::sync_scheduler::SyncScheduler;
use crate::worker::{Op, Request, Response, ShardWorker};

/// Aggregated, process-wide statistics returned by `Stats`.
#[derive(Clone, Debug)]
pub struct Stats {
    pub curr_items: u64,
    pub bytes: u64,
    pub allocated_bytes: u64,
    pub pid: u32,
    pub uptime: Duration,
    pub time: i64,
    pub version: &'static str,
}

struct ShardHandle {
    tx: Option<Sender<Request>>,
    handle: Option<JoinHandle<()>>,
}

/// The storage engine core: N shard workers plus the sync scheduler.
///
/// Dropping an `Engine` shuts it down cooperatively: every shard's mailbox
/// sender is dropped (so each worker drains what's queued, fsyncs, and
/// exits), the worker threads are joined, and only then is the sync
/// scheduler's own sender dropped and its thread joined.
pub struct Engine {
    config: EngineConfig,
    shards: Vec<ShardHandle>,
    sync_scheduler: Option<SyncScheduler>,
    started_at: Instant,
}

impl Engine {
    /// Opens (creating if needed) the data directory and spawns every
    /// shard worker, recovering each shard's index from disk.
    pub fn open(config: EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let sync_scheduler = if matches!(config.durability, Durability::Periodic) {
            Some(SyncScheduler::spawn((config.shard_count as usize).max(1) * 2))
        } else {
            None
        };
        let sync_tx = sync_scheduler.as_ref().map(SyncScheduler::sender);

        let mut shards = Vec::with_capacity(config.shard_count as usize);
        for index in 0..config.shard_count {
            let (handle, tx) = ShardWorker::spawn(index, &config, sync_tx.clone())?;
            shards.push(ShardHandle {
                tx: Some(tx),
                handle: Some(handle),
            });
        }

        log::info!(
            "engine opened at {}, {} shards, durability={:?}",
            config.data_dir.display(),
            config.shard_count,
            config.durability
        );

        Ok(Self {
            config,
            shards,
            sync_scheduler,
            started_at: Instant::now(),
        })
    }

    fn shard_for(&self, key: &[u8]) -> &ShardHandle {
        let index = shard_for_key(key, self.config.shard_count);
        &self.shards[index as usize]
    }

    fn call(&self, shard: &ShardHandle, make_request: impl FnOnce(Sender<Response>) -> Request) -> Result<Response> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let request = make_request(reply_tx);
        shard
            .tx
            .as_ref()
            .expect("engine shut down")
            .send(request)
            .map_err(|_| EngineError::Io(io::Error::new(io::ErrorKind::Other, "shard worker is gone")))?;
        reply_rx
            .recv()
            .map_err(|_| EngineError::Io(io::Error::new(io::ErrorKind::Other, "shard worker dropped the reply")))
    }

    fn request(
        &self,
        key: &[u8],
        op: Op,
        value: Vec<u8>,
        ttl: Duration,
        cas_witness: u64,
        delta: u64,
    ) -> Result<Response> {
        let shard = self.shard_for(key);
        self.call(shard, |reply| Request {
            op,
            key: key.to_vec(),
            value,
            ttl,
            cas_witness,
            delta,
            reply,
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<(Vec<u8>, u64)> {
        match self.request(key, Op::Get, Vec::new(), Duration::ZERO, 0, 0)? {
            Response::Value { value, cas } => Ok((value, cas)),
            Response::Err(err) => Err(err),
            _ => unreachable!("Get always replies Value or Err"),
        }
    }

    pub fn set(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<u64> {
        self.cas_response(self.request(key, Op::Set, value.to_vec(), ttl, 0, 0)?)
    }

    pub fn add(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<u64> {
        self.cas_response(self.request(key, Op::Add, value.to_vec(), ttl, 0, 0)?)
    }

    pub fn replace(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<u64> {
        self.cas_response(self.request(key, Op::Replace, value.to_vec(), ttl, 0, 0)?)
    }

    pub fn cas(&self, key: &[u8], value: &[u8], ttl: Duration, witness: u64) -> Result<u64> {
        self.cas_response(self.request(key, Op::Cas, value.to_vec(), ttl, witness, 0)?)
    }

    pub fn touch(&self, key: &[u8], ttl: Duration) -> Result<u64> {
        self.cas_response(self.request(key, Op::Touch, Vec::new(), ttl, 0, 0)?)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        match self.request(key, Op::Delete, Vec::new(), Duration::ZERO, 0, 0)? {
            Response::Ok => Ok(()),
            Response::Err(err) => Err(err),
            _ => unreachable!("Delete always replies Ok or Err"),
        }
    }

    pub fn increment(&self, key: &[u8], delta: u64) -> Result<(Vec<u8>, u64)> {
        self.value_response(self.request(key, Op::Increment, Vec::new(), Duration::ZERO, 0, delta)?)
    }

    pub fn decrement(&self, key: &[u8], delta: u64) -> Result<(Vec<u8>, u64)> {
        self.value_response(self.request(key, Op::Decrement, Vec::new(), Duration::ZERO, 0, delta)?)
    }

    pub fn append(&self, key: &[u8], tail: &[u8]) -> Result<u64> {
        self.cas_response(self.request(key, Op::Append, tail.to_vec(), Duration::ZERO, 0, 0)?)
    }

    pub fn prepend(&self, key: &[u8], head: &[u8]) -> Result<u64> {
        self.cas_response(self.request(key, Op::Prepend, head.to_vec(), Duration::ZERO, 0, 0)?)
    }

    /// Resets every shard: empty index, truncated files, zeroed counters.
    pub fn flush_all(&self) -> Result<()> {
        for shard in &self.shards {
            match self.call(shard, |reply| Request {
                op: Op::FlushAll,
                key: Vec::new(),
                value: Vec::new(),
                ttl: Duration::ZERO,
                cas_witness: 0,
                delta: 0,
                reply,
            })? {
                Response::Ok => {}
                Response::Err(err) => return Err(err),
                _ => unreachable!("FlushAll always replies Ok or Err"),
            }
        }
        Ok(())
    }

    /// Aggregates `curr_items`/`bytes`/`allocated_bytes` across every shard
    /// and adds process-wide fields.
    pub fn stats(&self) -> Result<Stats> {
        let mut curr_items = 0u64;
        let mut bytes = 0u64;
        let mut allocated_bytes = 0u64;
        for shard in &self.shards {
            match self.call(shard, |reply| Request {
                op: Op::Stats,
                key: Vec::new(),
                value: Vec::new(),
                ttl: Duration::ZERO,
                cas_witness: 0,
                delta: 0,
                reply,
            })? {
                Response::Stats(s) => {
                    curr_items += s.curr_items;
                    bytes += s.bytes;
                    allocated_bytes += s.allocated_bytes;
                }
                Response::Err(err) => return Err(err),
                _ => unreachable!("Stats always replies Stats or Err"),
            }
        }
        Ok(Stats {
            curr_items,
            bytes,
            allocated_bytes,
            pid: process::id(),
            uptime: self.started_at.elapsed(),
            time: now_ms(),
            version: env!("CARGO_PKG_VERSION"),
        })
    }

    fn cas_response(&self, response: Response) -> Result<u64> {
        match response {
            Response::Cas(cas) => Ok(cas),
            Response::Err(err) => Err(err),
            _ => unreachable!("this op always replies Cas or Err"),
        }
    }

    fn value_response(&self, response: Response) -> Result<(Vec<u8>, u64)> {
        match response {
            Response::Value { value, cas } => Ok((value, cas)),
            Response::Err(err) => Err(err),
            _ => unreachable!("this op always replies Value or Err"),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for shard in &mut self.shards {
            shard.tx.take();
        }
        for shard in &mut self.shards {
            if let Some(handle) = shard.handle.take() {
                let _ = handle.join();
            }
        }
        log::info!("engine shut down");
        // `self.sync_scheduler` drops after this body returns, by which
        // point every shard's own clone of its sender is already gone.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine(dir: &Path) -> Engine {
        let config = EngineConfig::builder(dir)
            .shard_count(4)
            .durability(Durability::None)
            .build();
        Engine::open(config).unwrap()
    }

    #[test]
    fn put_get_cycle_across_shards() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        for i in 0..20 {
            let key = format!("key-{i}");
            engine.set(key.as_bytes(), b"value", Duration::ZERO).unwrap();
        }
        for i in 0..20 {
            let key = format!("key-{i}");
            let (value, _) = engine.get(key.as_bytes()).unwrap();
            assert_eq!(value, b"value");
        }
    }

    #[test]
    fn flush_all_empties_every_shard() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        for i in 0..10 {
            let key = format!("k{i}");
            engine.set(key.as_bytes(), b"v", Duration::ZERO).unwrap();
        }
        engine.flush_all().unwrap();
        let stats = engine.stats().unwrap();
        assert_eq!(stats.curr_items, 0);
        assert!(matches!(engine.get(b"k0").unwrap_err(), EngineError::KeyNotFound));
    }

    #[test]
    fn stats_aggregate_across_shards() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        engine.set(b"a", b"1234", Duration::ZERO).unwrap();
        engine.set(b"b", b"12345678", Duration::ZERO).unwrap();
        let stats = engine.stats().unwrap();
        assert_eq!(stats.curr_items, 2);
        assert_eq!(stats.bytes, 12);
    }

    #[test]
    fn persistence_round_trips_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let engine = engine(dir.path());
            engine.set(b"k1", b"v1", Duration::ZERO).unwrap();
            engine.set(b"k2", b"v2", Duration::ZERO).unwrap();
        }
        let engine = engine(dir.path());
        assert_eq!(engine.get(b"k1").unwrap().0, b"v1");
        assert_eq!(engine.get(b"k2").unwrap().0, b"v2");
        assert_eq!(engine.stats().unwrap().curr_items, 2);
    }
}
