//! Per-bucket data-file compaction over a bounded shard worker pool.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{
    chain::JobError,
    headroom,
    logging::maint_log,
    metrics::Metrics,
    policy,
    services::{CompactOptions, DiskUsage, EngineError, ShardId, StorageEngine},
    settings::ResolvedThresholds,
    throttle::Throttle,
};

/// Remaining-work state shared by the shard workers.
///
/// The queue lives outside any single worker, so a crashed worker never
/// takes the remaining shard list down with it.
#[derive(Debug)]
pub(crate) struct ShardQueue {
    inner: Mutex<ShardQueueInner>,
}

#[derive(Debug)]
struct ShardQueueInner {
    pending: VecDeque<ShardId>,
    total: usize,
    completed: usize,
}

impl ShardQueue {
    pub(crate) fn new(shards: Vec<ShardId>) -> Arc<Self> {
        let total = shards.len();
        Arc::new(Self {
            inner: Mutex::new(ShardQueueInner {
                pending: shards.into(),
                total,
                completed: 0,
            }),
        })
    }

    /// Hand out the next shard, if any remain.
    pub(crate) fn pick_next(&self) -> Option<ShardId> {
        match self.inner.lock() {
            Ok(mut inner) => inner.pending.pop_front(),
            Err(_) => None,
        }
    }

    /// Record one shard as handled; returns `(completed, total)`.
    pub(crate) fn update_progress(&self) -> (usize, usize) {
        match self.inner.lock() {
            Ok(mut inner) => {
                inner.completed += 1;
                (inner.completed, inner.total)
            }
            Err(_) => (0, 0),
        }
    }
}

/// Everything one data-file compaction run needs, bundled for the pool.
pub(crate) struct ShardRun {
    pub(crate) bucket: String,
    pub(crate) engine: Arc<dyn StorageEngine>,
    pub(crate) disk: Arc<dyn DiskUsage>,
    pub(crate) throttle: Arc<Throttle>,
    pub(crate) thresholds: ResolvedThresholds,
    pub(crate) min_file_size: u64,
    pub(crate) options: CompactOptions,
    pub(crate) workers: usize,
    /// Forced runs skip the fragmentation check and bypass the throttle.
    pub(crate) forced: bool,
    pub(crate) metrics: Arc<Metrics>,
}

impl ShardRun {
    /// Compact every listed shard, at most `workers` at a time.
    ///
    /// The first failing worker cancels its siblings; every join is still
    /// awaited before the run reports, so no shard rewrite is abandoned.
    pub(crate) async fn execute(
        self,
        shards: Vec<ShardId>,
        cancel: CancellationToken,
    ) -> Result<(), JobError> {
        if shards.is_empty() {
            return Ok(());
        }
        let queue = ShardQueue::new(shards);
        let run = Arc::new(self);
        let run_cancel = cancel.child_token();
        let mut pool = JoinSet::new();
        for worker in 0..run.workers.max(1) {
            pool.spawn(Self::worker(
                worker,
                Arc::clone(&run),
                Arc::clone(&queue),
                run_cancel.clone(),
            ));
        }
        let mut first_failure = None;
        while let Some(joined) = pool.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(err) => Err(JobError::Worker(err.to_string())),
            };
            if let Err(err) = result {
                if first_failure.is_none() {
                    run_cancel.cancel();
                    first_failure = Some(err);
                }
            }
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn worker(
        worker: usize,
        run: Arc<Self>,
        queue: Arc<ShardQueue>,
        cancel: CancellationToken,
    ) -> Result<(), JobError> {
        while let Some(shard) = queue.pick_next() {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let stats = match run.engine.shard_stats(&run.bucket, shard).await {
                Ok(stats) => stats,
                Err(EngineError::StatsUnavailable(target)) => {
                    maint_log!(
                        log::Level::Debug,
                        "shard_stats_unavailable",
                        "bucket={} shard={shard} target={target}",
                        run.bucket,
                    );
                    queue.update_progress();
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if !run.forced && !policy::needs_compaction(stats, run.min_file_size, run.thresholds) {
                queue.update_progress();
                continue;
            }
            headroom::ensure_headroom(
                run.disk.as_ref(),
                &run.engine.data_path(&run.bucket),
                stats.data_size,
            )?;
            let permit = if run.forced {
                None
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    permit = run.throttle.acquire() => Some(permit?),
                }
            };
            let reclaimed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                result = run
                    .engine
                    .compact_shard(&run.bucket, shard, &run.options, &cancel) => result?,
            };
            drop(permit);
            run.metrics.record_shard_compacted(reclaimed);
            let (completed, total) = queue.update_progress();
            maint_log!(
                log::Level::Debug,
                "shard_compacted",
                "bucket={} shard={shard} worker={worker} progress={completed}/{total}",
                run.bucket,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        path::{Path, PathBuf},
        sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    };

    use async_trait::async_trait;

    use super::*;
    use crate::services::{FileStats, IndexGroupId, IndexKind};

    #[test]
    fn queue_hands_out_each_shard_once() {
        let queue = ShardQueue::new(vec![ShardId(0), ShardId(1), ShardId(2)]);
        assert_eq!(queue.pick_next(), Some(ShardId(0)));
        assert_eq!(queue.pick_next(), Some(ShardId(1)));
        assert_eq!(queue.update_progress(), (1, 3));
        assert_eq!(queue.pick_next(), Some(ShardId(2)));
        assert_eq!(queue.pick_next(), None);
    }

    struct StaticDisk(u64);

    impl DiskUsage for StaticDisk {
        fn free_space(&self, _path: &Path) -> io::Result<u64> {
            Ok(self.0)
        }
    }

    /// Engine whose shards are all equally fragmented, tracking concurrency.
    struct CountingEngine {
        stats: FileStats,
        active: AtomicUsize,
        max_active: AtomicUsize,
        compacted: AtomicU64,
    }

    impl CountingEngine {
        fn new(stats: FileStats) -> Self {
            Self {
                stats,
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                compacted: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl StorageEngine for CountingEngine {
        async fn shard_stats(&self, _bucket: &str, _shard: ShardId) -> Result<FileStats, EngineError> {
            Ok(self.stats)
        }

        async fn master_stats(&self, _bucket: &str) -> Result<FileStats, EngineError> {
            Ok(self.stats)
        }

        async fn index_group_stats(
            &self,
            _bucket: &str,
            _group: &IndexGroupId,
        ) -> Result<FileStats, EngineError> {
            Ok(self.stats)
        }

        async fn list_index_groups(&self, _bucket: &str) -> Result<Vec<IndexGroupId>, EngineError> {
            Ok(Vec::new())
        }

        async fn compact_shard(
            &self,
            _bucket: &str,
            _shard: ShardId,
            _options: &CompactOptions,
            _cancel: &CancellationToken,
        ) -> Result<u64, EngineError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.compacted.fetch_add(1, Ordering::SeqCst);
            Ok(10)
        }

        async fn compact_master(
            &self,
            _bucket: &str,
            _cancel: &CancellationToken,
        ) -> Result<u64, EngineError> {
            Ok(0)
        }

        async fn compact_index_group(
            &self,
            _bucket: &str,
            _group: &IndexGroupId,
            _kind: IndexKind,
            _cancel: &CancellationToken,
        ) -> Result<u64, EngineError> {
            Ok(0)
        }

        fn data_path(&self, bucket: &str) -> PathBuf {
            PathBuf::from("/data").join(bucket)
        }

        fn index_path(&self, bucket: &str) -> PathBuf {
            PathBuf::from("/index").join(bucket)
        }
    }

    fn fragmented() -> FileStats {
        FileStats {
            data_size: 10,
            file_size: 1 << 20,
        }
    }

    #[tokio::test]
    async fn throttle_bounds_concurrent_shard_compactions() {
        let engine = Arc::new(CountingEngine::new(fragmented()));
        let run = ShardRun {
            bucket: "travel".to_string(),
            engine: Arc::clone(&engine) as Arc<dyn StorageEngine>,
            disk: Arc::new(StaticDisk(u64::MAX)),
            throttle: Throttle::new("test", 1),
            thresholds: ResolvedThresholds {
                percent: 50,
                size: u64::MAX,
            },
            min_file_size: 0,
            options: CompactOptions::default(),
            workers: 4,
            forced: false,
            metrics: Arc::new(Metrics::default()),
        };
        let shards = (0..8).map(ShardId).collect();
        run.execute(shards, CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(engine.compacted.load(Ordering::SeqCst), 8);
        assert_eq!(
            engine.max_active.load(Ordering::SeqCst),
            1,
            "limit-1 throttle must serialize shard rewrites"
        );
    }

    #[tokio::test]
    async fn non_fragmented_shards_are_skipped() {
        let engine = Arc::new(CountingEngine::new(FileStats {
            data_size: 1 << 20,
            file_size: 1 << 20,
        }));
        let run = ShardRun {
            bucket: "travel".to_string(),
            engine: Arc::clone(&engine) as Arc<dyn StorageEngine>,
            disk: Arc::new(StaticDisk(u64::MAX)),
            throttle: Throttle::new("test", 1),
            thresholds: ResolvedThresholds {
                percent: 50,
                size: u64::MAX,
            },
            min_file_size: 0,
            options: CompactOptions::default(),
            workers: 2,
            forced: false,
            metrics: Arc::new(Metrics::default()),
        };
        run.execute(vec![ShardId(0), ShardId(1)], CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(engine.compacted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn insufficient_space_fails_the_run() {
        let engine = Arc::new(CountingEngine::new(fragmented()));
        let run = ShardRun {
            bucket: "travel".to_string(),
            engine: Arc::clone(&engine) as Arc<dyn StorageEngine>,
            disk: Arc::new(StaticDisk(0)),
            throttle: Throttle::new("test", 1),
            thresholds: ResolvedThresholds {
                percent: 50,
                size: u64::MAX,
            },
            min_file_size: 0,
            options: CompactOptions::default(),
            workers: 2,
            forced: false,
            metrics: Arc::new(Metrics::default()),
        };
        let err = run
            .execute(vec![ShardId(0)], CancellationToken::new())
            .await
            .expect_err("headroom must fail");
        assert!(matches!(err, JobError::Headroom(_)));
        assert_eq!(engine.compacted.load(Ordering::SeqCst), 0);
    }
}
