//! Collaborator seams: configuration, topology, storage engine, disk usage.
//!
//! The daemon never touches files or cluster metadata directly; everything
//! flows through these traits so the engine stays substitutable in tests.

use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::settings::{BucketOverride, CompactionSettings};

/// A partition of a bucket's keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId(pub u16);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Named collection of index definitions over a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexGroupId(pub String);

impl fmt::Display for IndexGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which index variant of a group to rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// The actively served index.
    Main,
    /// The replica-maintained index.
    Replica,
}

/// Whether a bucket keeps its data on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    /// Disk-backed; subject to compaction.
    Persistent,
    /// Memory-only; never compacted.
    Ephemeral,
}

/// A bucket as reported by the directory.
#[derive(Debug, Clone)]
pub struct BucketInfo {
    /// Bucket name.
    pub name: String,
    /// Storage kind.
    pub kind: BucketKind,
}

/// Point-in-time size statistics for one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStats {
    /// Bytes attributable to live data.
    pub data_size: u64,
    /// Bytes the file occupies on disk.
    pub file_size: u64,
}

/// Options forwarded to the storage engine for a data-file rewrite.
#[derive(Debug, Clone, Default)]
pub struct CompactOptions {
    /// Drop tombstones eagerly.
    pub purge_deletes: bool,
    /// Keys known stale that a partial compaction drops without a stats
    /// check.
    pub obsolete_keys: Vec<Vec<u8>>,
}

/// Failures reported by the storage engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine is not serving this target yet; treated as "not due".
    #[error("size stats unavailable for {0}")]
    StatsUnavailable(String),
    /// The engine refused the operation outright.
    #[error("storage engine rejected the operation: {0}")]
    Rejected(String),
    /// The rewrite started and then failed.
    #[error("storage engine failed: {0}")]
    Failed(String),
}

/// The opaque file-rewriting engine. All long-running calls take a
/// [`CancellationToken`] and are expected to return promptly once it fires.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Size statistics for one shard's data file.
    async fn shard_stats(&self, bucket: &str, shard: ShardId) -> Result<FileStats, EngineError>;

    /// Size statistics for the bucket's master metadata db.
    async fn master_stats(&self, bucket: &str) -> Result<FileStats, EngineError>;

    /// Size statistics for one index group (all variants combined).
    async fn index_group_stats(
        &self,
        bucket: &str,
        group: &IndexGroupId,
    ) -> Result<FileStats, EngineError>;

    /// Index groups currently defined over the bucket.
    async fn list_index_groups(&self, bucket: &str) -> Result<Vec<IndexGroupId>, EngineError>;

    /// Rewrite one shard's data file; returns bytes reclaimed.
    async fn compact_shard(
        &self,
        bucket: &str,
        shard: ShardId,
        options: &CompactOptions,
        cancel: &CancellationToken,
    ) -> Result<u64, EngineError>;

    /// Rewrite the bucket's master metadata db; returns bytes reclaimed.
    async fn compact_master(
        &self,
        bucket: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, EngineError>;

    /// Rewrite one variant of an index group; returns bytes reclaimed.
    async fn compact_index_group(
        &self,
        bucket: &str,
        group: &IndexGroupId,
        kind: IndexKind,
        cancel: &CancellationToken,
    ) -> Result<u64, EngineError>;

    /// Filesystem location of the bucket's data files.
    fn data_path(&self, bucket: &str) -> PathBuf;

    /// Filesystem location of the bucket's index files.
    fn index_path(&self, bucket: &str) -> PathBuf;
}

/// Bucket topology and ownership lookup.
#[async_trait]
pub trait BucketDirectory: Send + Sync {
    /// All buckets currently defined in the cluster.
    async fn list_buckets(&self) -> Vec<BucketInfo>;

    /// Shards of `bucket` owned by this node.
    async fn owned_shards(&self, bucket: &str) -> Vec<ShardId>;

    /// Whether the bucket exists at all.
    async fn bucket_exists(&self, bucket: &str) -> bool;
}

/// Read-only free-space probe for the filesystem containing a path.
pub trait DiskUsage: Send + Sync {
    /// Free bytes on the filesystem containing `path`.
    fn free_space(&self, path: &Path) -> io::Result<u64>;
}

/// Cluster-wide configuration storage and distribution.
#[async_trait]
pub trait ConfigService: Send + Sync {
    /// Current global autocompaction settings.
    async fn settings(&self) -> CompactionSettings;

    /// Replace the global autocompaction settings.
    async fn update_settings(&self, settings: CompactionSettings);

    /// Per-bucket override, when one is configured.
    async fn bucket_override(&self, bucket: &str) -> Option<BucketOverride>;

    /// Change stream; a full copy of the settings is sent on every update.
    fn subscribe(&self) -> flume::Receiver<CompactionSettings>;
}
