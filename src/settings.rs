//! Typed compaction configuration: global defaults and per-bucket overrides.

use std::time::Duration;

use crate::window::WindowConfig;

/// Fragmentation trigger thresholds; either half may be unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FragThresholds {
    /// Fire when fragmentation reaches this percentage of the file size.
    pub percent: Option<u32>,
    /// Fire when the absolute fragmented byte count reaches this size.
    pub size: Option<u64>,
}

impl FragThresholds {
    /// Percent-only thresholds.
    pub fn percent(percent: u32) -> Self {
        Self {
            percent: Some(percent),
            size: None,
        }
    }

    /// Size-only thresholds.
    pub fn size(size: u64) -> Self {
        Self {
            percent: None,
            size: Some(size),
        }
    }

    /// Resolve the unset halves to their disabled sentinels: a missing
    /// percent never fires on its own (100), a missing size never fires on
    /// its own (`u64::MAX`).
    pub(crate) fn resolve(self) -> ResolvedThresholds {
        ResolvedThresholds {
            percent: self.percent.unwrap_or(100),
            size: self.size.unwrap_or(u64::MAX),
        }
    }
}

/// Thresholds with both halves resolved to concrete values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedThresholds {
    pub percent: u32,
    pub size: u64,
}

/// Global autocompaction settings, distributed by the config service.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionSettings {
    /// Thresholds for data files (shards and the master db).
    pub db_fragmentation: FragThresholds,
    /// Thresholds for search-index files.
    pub view_fragmentation: FragThresholds,
    /// Allowed time-of-day window; `None` means always allowed.
    pub window: Option<WindowConfig>,
    /// Allow data-file and index compaction for a bucket to overlap.
    pub parallel_db_and_view: bool,
    /// Drop tombstones eagerly during data-file rewrites.
    pub purge_deletes: bool,
    /// Interval between scheduled sweeps of each track.
    pub check_interval: Duration,
    /// Token count of the data-file compaction throttle.
    pub data_compaction_limit: usize,
    /// Worker pool size for per-bucket shard compaction.
    pub shard_workers: usize,
    /// Files at or below this size are never considered fragmented.
    pub min_file_size: u64,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            db_fragmentation: FragThresholds::default(),
            view_fragmentation: FragThresholds::default(),
            window: None,
            parallel_db_and_view: false,
            purge_deletes: false,
            check_interval: Duration::from_secs(30),
            data_compaction_limit: 1,
            shard_workers: 4,
            min_file_size: 128 * 1024,
        }
    }
}

impl CompactionSettings {
    /// Set the data-file fragmentation thresholds.
    pub fn db_fragmentation(self, db_fragmentation: FragThresholds) -> Self {
        Self {
            db_fragmentation,
            ..self
        }
    }

    /// Set the index-file fragmentation thresholds.
    pub fn view_fragmentation(self, view_fragmentation: FragThresholds) -> Self {
        Self {
            view_fragmentation,
            ..self
        }
    }

    /// Set the allowed time-of-day window.
    pub fn window(self, window: WindowConfig) -> Self {
        Self {
            window: Some(window),
            ..self
        }
    }

    /// Allow data-file and index compaction to overlap per bucket.
    pub fn parallel_db_and_view(self, parallel_db_and_view: bool) -> Self {
        Self {
            parallel_db_and_view,
            ..self
        }
    }

    /// Drop tombstones eagerly during data-file rewrites.
    pub fn purge_deletes(self, purge_deletes: bool) -> Self {
        Self {
            purge_deletes,
            ..self
        }
    }

    /// Set the interval between scheduled sweeps.
    pub fn check_interval(self, check_interval: Duration) -> Self {
        Self {
            check_interval,
            ..self
        }
    }

    /// Set the data-file compaction throttle limit.
    pub fn data_compaction_limit(self, data_compaction_limit: usize) -> Self {
        Self {
            data_compaction_limit,
            ..self
        }
    }

    /// Set the shard worker pool size.
    pub fn shard_workers(self, shard_workers: usize) -> Self {
        Self {
            shard_workers,
            ..self
        }
    }

    /// Set the minimum file size considered for compaction.
    pub fn min_file_size(self, min_file_size: u64) -> Self {
        Self {
            min_file_size,
            ..self
        }
    }
}

/// Per-bucket override; unset fields inherit the global settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketOverride {
    /// Override for the data-file thresholds.
    pub db_fragmentation: Option<FragThresholds>,
    /// Override for the index-file thresholds.
    pub view_fragmentation: Option<FragThresholds>,
    /// Override for the allowed window.
    pub window: Option<WindowConfig>,
    /// Override for the parallel db/view flag.
    pub parallel_db_and_view: Option<bool>,
    /// Override for the purge flag.
    pub purge_deletes: Option<bool>,
}

/// Effective configuration for one bucket after the global/override merge.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketConfig {
    /// Data-file fragmentation thresholds.
    pub db_fragmentation: FragThresholds,
    /// Index-file fragmentation thresholds.
    pub view_fragmentation: FragThresholds,
    /// Allowed time-of-day window.
    pub window: Option<WindowConfig>,
    /// Whether data-file and index compaction may overlap.
    pub parallel_db_and_view: bool,
    /// Whether tombstones are purged during rewrites.
    pub purge_deletes: bool,
    /// Minimum file size considered for compaction.
    pub min_file_size: u64,
    /// Shard worker pool size.
    pub shard_workers: usize,
}

impl BucketConfig {
    /// Merge the global settings with a bucket's override, field-wise.
    pub fn merged(global: &CompactionSettings, bucket: Option<&BucketOverride>) -> Self {
        let mut config = Self {
            db_fragmentation: global.db_fragmentation,
            view_fragmentation: global.view_fragmentation,
            window: global.window,
            parallel_db_and_view: global.parallel_db_and_view,
            purge_deletes: global.purge_deletes,
            min_file_size: global.min_file_size,
            shard_workers: global.shard_workers,
        };
        let Some(over) = bucket else {
            return config;
        };
        if let Some(thresholds) = over.db_fragmentation {
            config.db_fragmentation = thresholds;
        }
        if let Some(thresholds) = over.view_fragmentation {
            config.view_fragmentation = thresholds;
        }
        if let Some(window) = over.window {
            config.window = Some(window);
        }
        if let Some(parallel) = over.parallel_db_and_view {
            config.parallel_db_and_view = parallel;
        }
        if let Some(purge) = over.purge_deletes {
            config.purge_deletes = purge;
        }
        config
    }
}
