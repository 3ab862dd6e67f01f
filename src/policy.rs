//! Fragmentation policy: is a file due for compaction.

use crate::{services::FileStats, settings::ResolvedThresholds};

/// Decide whether a file is fragmented enough to rewrite.
///
/// Files at or below `min_file_size` are never due; this also keeps the
/// percentage computation away from empty files. Otherwise the file is due
/// when the fragmentation percentage reaches the percent threshold or the
/// absolute fragmented byte count reaches the size threshold.
pub(crate) fn needs_compaction(
    stats: FileStats,
    min_file_size: u64,
    thresholds: ResolvedThresholds,
) -> bool {
    if stats.file_size <= min_file_size {
        return false;
    }
    let garbage = stats.file_size.saturating_sub(stats.data_size);
    let frag_pct = ((garbage as f64 / stats.file_size as f64) * 100.0).round() as u32;
    frag_pct >= thresholds.percent || garbage >= thresholds.size
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(data_size: u64, file_size: u64) -> FileStats {
        FileStats {
            data_size,
            file_size,
        }
    }

    fn thresholds(percent: u32, size: u64) -> ResolvedThresholds {
        ResolvedThresholds { percent, size }
    }

    #[test]
    fn small_files_are_never_due() {
        let aggressive = thresholds(0, 0);
        assert!(!needs_compaction(stats(0, 0), 4096, aggressive));
        assert!(!needs_compaction(stats(0, 4096), 4096, aggressive));
        assert!(!needs_compaction(stats(1, 100), 4096, aggressive));
    }

    #[test]
    fn percent_threshold_fires() {
        assert!(needs_compaction(
            stats(50, 100),
            0,
            thresholds(40, u64::MAX)
        ));
        assert!(!needs_compaction(
            stats(70, 100),
            0,
            thresholds(40, u64::MAX)
        ));
    }

    #[test]
    fn size_threshold_fires_below_percent() {
        // 5% fragmentation, but 5 garbage bytes >= the 3-byte size threshold.
        assert!(needs_compaction(stats(95, 100), 0, thresholds(40, 3)));
        assert!(!needs_compaction(stats(99, 100), 0, thresholds(40, 3)));
    }

    #[test]
    fn percentage_is_rounded() {
        // 34.5% rounds to 35.
        assert!(needs_compaction(
            stats(655, 1000),
            0,
            thresholds(35, u64::MAX)
        ));
        // 34.4% rounds to 34.
        assert!(!needs_compaction(
            stats(656, 1000),
            0,
            thresholds(35, u64::MAX)
        ));
    }
}
