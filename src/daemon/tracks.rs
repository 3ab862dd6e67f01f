//! Per-track bookkeeping and compaction chain construction.

use std::{collections::VecDeque, future::Future, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    chain::{ChainItem, JobError},
    headroom,
    logging::maint_log,
    policy,
    process::LinkedProcess,
    scheduler::TrackScheduler,
    services::{BucketKind, CompactOptions, EngineError, IndexGroupId, IndexKind},
    settings::BucketConfig,
    shards::ShardRun,
    window::{Clock, WindowConfig},
};

use super::{DaemonEvent, Shared};

/// The three independently scheduled maintenance tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackKind {
    /// Shard data files.
    DataFiles,
    /// Search-index files.
    ViewIndexes,
    /// Per-bucket master metadata dbs.
    MasterDb,
}

impl TrackKind {
    pub(crate) const ALL: [TrackKind; 3] = [
        TrackKind::DataFiles,
        TrackKind::ViewIndexes,
        TrackKind::MasterDb,
    ];

    pub(crate) fn label(self) -> &'static str {
        match self {
            TrackKind::DataFiles => "data",
            TrackKind::ViewIndexes => "views",
            TrackKind::MasterDb => "master",
        }
    }

    /// Only disk-backed buckets have files to compact.
    pub(crate) fn applies_to(self, kind: BucketKind) -> bool {
        kind == BucketKind::Persistent
    }
}

/// Live compactor occupying a track.
pub(crate) struct RunningChain {
    pub(crate) process: LinkedProcess,
    pub(crate) bucket: String,
    /// An uninhibit-triggered run executing outside the queue.
    pub(crate) priority: bool,
}

/// One scheduled maintenance track: the buckets pending this cycle, the
/// running compactor (or none), and the tick scheduler.
pub(crate) struct Track {
    pub(crate) queue: VecDeque<String>,
    pub(crate) running: Option<RunningChain>,
    pub(crate) scheduler: TrackScheduler<DaemonEvent>,
}

impl Track {
    pub(crate) fn new(
        kind: TrackKind,
        interval: Duration,
        tx: flume::Sender<DaemonEvent>,
    ) -> Self {
        Self {
            queue: VecDeque::new(),
            running: None,
            scheduler: TrackScheduler::new(
                interval,
                tx,
                Box::new(move |generation| DaemonEvent::Tick {
                    track: kind,
                    generation,
                }),
            ),
        }
    }
}

/// Target selection for a forced run.
pub(crate) enum ForcedScope {
    /// Data files plus every index group.
    WholeBucket,
    /// Data files only.
    DataFiles,
    /// One index group.
    SingleView(IndexGroupId),
}

/// Chain items for one scheduled sweep of `bucket` on `kind`.
pub(crate) async fn build_track_items(
    shared: &Shared,
    kind: TrackKind,
    bucket: &str,
    config: &BucketConfig,
) -> Vec<ChainItem> {
    match kind {
        TrackKind::DataFiles => {
            let options = CompactOptions {
                purge_deletes: config.purge_deletes,
                obsolete_keys: Vec::new(),
            };
            vec![data_item(shared, bucket, config, options, false)]
        }
        TrackKind::MasterDb => vec![master_item(shared, bucket, config, false)],
        TrackKind::ViewIndexes => view_items(shared, bucket, config, false).await,
    }
}

/// Chain items for the uninhibit-triggered priority run. The run bypasses
/// the window and the throttle: a waiting rebalance must not stall on them.
pub(crate) async fn priority_view_items(
    shared: &Shared,
    bucket: &str,
    config: &BucketConfig,
) -> Vec<ChainItem> {
    view_items(shared, bucket, config, true).await
}

/// Chain items for a forced run.
pub(crate) async fn build_forced_items(
    shared: &Shared,
    scope: ForcedScope,
    bucket: &str,
    config: &BucketConfig,
    options: CompactOptions,
) -> Vec<ChainItem> {
    match scope {
        ForcedScope::DataFiles => vec![
            data_item(shared, bucket, config, options, true),
            master_item(shared, bucket, config, true),
        ],
        ForcedScope::WholeBucket => {
            let mut items = vec![
                data_item(shared, bucket, config, options, true),
                master_item(shared, bucket, config, true),
            ];
            items.extend(view_items(shared, bucket, config, true).await);
            items
        }
        ForcedScope::SingleView(group) => {
            vec![index_item(shared, bucket, group, config, true, true)]
        }
    }
}

async fn view_items(
    shared: &Shared,
    bucket: &str,
    config: &BucketConfig,
    forced: bool,
) -> Vec<ChainItem> {
    if !forced {
        // The window is evaluated once, before the engine is contacted.
        if let Some(window) = config.window {
            if !window.contains(shared.clock.time_of_day()) {
                maint_log!(
                    log::Level::Debug,
                    "outside_window",
                    "op=views bucket={bucket} skipped",
                );
                return Vec::new();
            }
        }
    }
    let groups = match shared.engine.list_index_groups(bucket).await {
        Ok(groups) => groups,
        Err(err) => {
            maint_log!(
                log::Level::Warn,
                "list_index_groups_failed",
                "bucket={bucket} error={err}",
            );
            Vec::new()
        }
    };
    groups
        .into_iter()
        .map(|group| index_item(shared, bucket, group, config, forced, false))
        .collect()
}

fn data_item(
    shared: &Shared,
    bucket: &str,
    config: &BucketConfig,
    options: CompactOptions,
    forced: bool,
) -> ChainItem {
    let shared = shared.clone();
    let config = config.clone();
    let bucket = bucket.to_string();
    let name = bucket.clone();
    ChainItem::new(
        "data",
        name,
        true,
        Box::new(move |cancel| {
            Box::pin(async move {
                let window = if forced { None } else { config.window };
                let clock = Arc::clone(&shared.clock);
                let label_bucket = bucket.clone();
                gated("data", &label_bucket, window, clock, cancel, move |cancel| {
                    run_data(shared, bucket, config, options, forced, cancel)
                })
                .await
            })
        }),
    )
}

fn master_item(shared: &Shared, bucket: &str, config: &BucketConfig, forced: bool) -> ChainItem {
    let shared = shared.clone();
    let config = config.clone();
    let bucket = bucket.to_string();
    let name = bucket.clone();
    ChainItem::new(
        "master",
        name,
        false,
        Box::new(move |cancel| {
            Box::pin(async move {
                let window = if forced { None } else { config.window };
                let clock = Arc::clone(&shared.clock);
                let label_bucket = bucket.clone();
                gated(
                    "master",
                    &label_bucket,
                    window,
                    clock,
                    cancel,
                    move |cancel| run_master(shared, bucket, config, forced, cancel),
                )
                .await
            })
        }),
    )
}

fn index_item(
    shared: &Shared,
    bucket: &str,
    group: IndexGroupId,
    config: &BucketConfig,
    forced: bool,
    important: bool,
) -> ChainItem {
    let shared = shared.clone();
    let config = config.clone();
    let bucket = bucket.to_string();
    let name = format!("{bucket}/{group}");
    ChainItem::new(
        "index",
        name,
        important,
        Box::new(move |cancel| {
            Box::pin(async move {
                let window = if forced { None } else { config.window };
                let clock = Arc::clone(&shared.clock);
                let label_bucket = bucket.clone();
                gated(
                    "index",
                    &label_bucket,
                    window,
                    clock,
                    cancel,
                    move |cancel| run_index(shared, bucket, group, config, forced, cancel),
                )
                .await
            })
        }),
    )
}

/// Apply the allowed-window policy around one sub-operation.
///
/// The window is evaluated exactly once, at the start. Outside the window
/// the operation exits without touching the storage engine. Inside it with
/// abort-outside set, a one-shot timer cancels the operation when the window
/// closes; the check is not repeated after that.
async fn gated<F, Fut>(
    op: &'static str,
    bucket: &str,
    window: Option<WindowConfig>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    run: F,
) -> Result<(), JobError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<(), JobError>>,
{
    let Some(window) = window else {
        return run(cancel).await;
    };
    let now = clock.time_of_day();
    if !window.contains(now) {
        maint_log!(
            log::Level::Debug,
            "outside_window",
            "op={op} bucket={bucket} skipped",
        );
        return Ok(());
    }
    let deadline = window.remaining(now).filter(|_| window.abort_outside);
    let Some(deadline) = deadline else {
        return run(cancel).await;
    };
    let op_cancel = cancel.child_token();
    let timer_cancel = op_cancel.clone();
    let timer = tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        timer_cancel.cancel();
    });
    let result = run(op_cancel.clone()).await;
    timer.abort();
    if op_cancel.is_cancelled() && !cancel.is_cancelled() {
        maint_log!(
            log::Level::Info,
            "window_closed",
            "op={op} bucket={bucket} run terminated at window close",
        );
    }
    result
}

async fn run_data(
    shared: Shared,
    bucket: String,
    config: BucketConfig,
    options: CompactOptions,
    forced: bool,
    cancel: CancellationToken,
) -> Result<(), JobError> {
    let shards = shared.directory.owned_shards(&bucket).await;
    if shards.is_empty() {
        return Ok(());
    }
    ShardRun {
        bucket,
        engine: Arc::clone(&shared.engine),
        disk: Arc::clone(&shared.disk),
        throttle: Arc::clone(&shared.throttle),
        thresholds: config.db_fragmentation.resolve(),
        min_file_size: config.min_file_size,
        options,
        workers: config.shard_workers,
        forced,
        metrics: Arc::clone(&shared.metrics),
    }
    .execute(shards, cancel)
    .await
}

async fn run_master(
    shared: Shared,
    bucket: String,
    config: BucketConfig,
    forced: bool,
    cancel: CancellationToken,
) -> Result<(), JobError> {
    let stats = match shared.engine.master_stats(&bucket).await {
        Ok(stats) => stats,
        Err(EngineError::StatsUnavailable(target)) => {
            maint_log!(
                log::Level::Debug,
                "master_stats_unavailable",
                "bucket={bucket} target={target}",
            );
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    if !forced
        && !policy::needs_compaction(stats, config.min_file_size, config.db_fragmentation.resolve())
    {
        return Ok(());
    }
    headroom::ensure_headroom(
        shared.disk.as_ref(),
        &shared.engine.data_path(&bucket),
        stats.data_size,
    )?;
    if cancel.is_cancelled() {
        return Ok(());
    }
    let reclaimed = shared.engine.compact_master(&bucket, &cancel).await?;
    shared.metrics.record_master_db_compacted(reclaimed);
    Ok(())
}

async fn run_index(
    shared: Shared,
    bucket: String,
    group: IndexGroupId,
    config: BucketConfig,
    forced: bool,
    cancel: CancellationToken,
) -> Result<(), JobError> {
    let stats = match shared.engine.index_group_stats(&bucket, &group).await {
        Ok(stats) => stats,
        Err(EngineError::StatsUnavailable(target)) => {
            maint_log!(
                log::Level::Debug,
                "index_stats_unavailable",
                "bucket={bucket} group={group} target={target}",
            );
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    if !forced
        && !policy::needs_compaction(
            stats,
            config.min_file_size,
            config.view_fragmentation.resolve(),
        )
    {
        return Ok(());
    }
    headroom::ensure_headroom(
        shared.disk.as_ref(),
        &shared.engine.index_path(&bucket),
        stats.data_size,
    )?;
    let mut reclaimed = 0;
    for kind in [IndexKind::Main, IndexKind::Replica] {
        if cancel.is_cancelled() {
            break;
        }
        reclaimed += shared
            .engine
            .compact_index_group(&bucket, &group, kind, &cancel)
            .await?;
    }
    shared.metrics.record_index_group_compacted(reclaimed);
    Ok(())
}
