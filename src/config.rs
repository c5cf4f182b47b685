//! Process-lifetime configuration for the storage engine core.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// How aggressively a shard fsyncs its files after a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Durability {
    /// Never fsync; rely on the OS to flush pages eventually.
    None,
    /// fsync the affected file after every successful write.
    Always,
    /// fsync at most once per `sync_interval`, via the `SyncScheduler`.
    Periodic,
}

/// Tunable parameters for the engine, populated by the (out-of-scope)
/// INI/CLI configuration loader.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Root directory holding one `shard_<NN>/` subdirectory per shard.
    pub data_dir: PathBuf,
    /// Number of independent shards, N >= 1.
    pub shard_count: u32,
    /// TTL applied when a mutation omits one; `None` means no expiry.
    pub default_ttl: Option<Duration>,
    /// Upper bound on any TTL (including `default_ttl`); `None` means unlimited.
    pub max_ttl: Option<Duration>,
    /// When to fsync shard files after a mutation.
    pub durability: Durability,
    /// Minimum spacing between fsyncs in `Periodic` mode.
    pub sync_interval: Duration,
    /// Bounded mailbox capacity for each shard worker.
    pub mailbox_capacity: usize,
}

impl EngineConfig {
    /// Returns a builder rooted at the given data directory with otherwise
    /// default settings (16 shards, no TTL cap, periodic durability).
    pub fn builder(data_dir: impl AsRef<Path>) -> EngineConfigBuilder {
        EngineConfigBuilder::new(data_dir)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            shard_count: 16,
            default_ttl: None,
            max_ttl: None,
            durability: Durability::Periodic,
            sync_interval: Duration::from_secs(1),
            mailbox_capacity: 1024,
        }
    }
}

/// Builder used to configure the engine before opening it, mirroring the
/// teacher crate's `CrabKvBuilder` chaining style.
#[derive(Clone, Debug)]
pub struct EngineConfigBuilder {
    inner: EngineConfig,
}

impl EngineConfigBuilder {
    /// Creates a builder rooted at the provided directory with default settings.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            inner: EngineConfig {
                data_dir: data_dir.as_ref().to_path_buf(),
                ..EngineConfig::default()
            },
        }
    }

    /// Sets the shard count. Values below 1 are clamped to 1.
    pub fn shard_count(mut self, count: u32) -> Self {
        self.inner.shard_count = count.max(1);
        self
    }

    /// Sets the TTL applied to writes that don't specify one.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.inner.default_ttl = Some(ttl);
        self
    }

    /// Caps every TTL (including the default) at the given duration.
    pub fn max_ttl(mut self, ttl: Duration) -> Self {
        self.inner.max_ttl = Some(ttl);
        self
    }

    /// Sets the durability mode.
    pub fn durability(mut self, durability: Durability) -> Self {
        self.inner.durability = durability;
        self
    }

    /// Sets the minimum spacing between fsyncs in `Periodic` mode.
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.inner.sync_interval = interval;
        self
    }

    /// Sets the bounded mailbox capacity for each shard worker.
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.inner.mailbox_capacity = capacity.max(1);
        self
    }

    /// Builds the final configuration.
    pub fn build(self) -> EngineConfig {
        self.inner
    }
}
