//! Disk headroom guard: refuse to compact without room for the rewrite.

use std::path::Path;

use thiserror::Error;

use crate::services::DiskUsage;

/// Why a headroom check failed.
#[derive(Debug, Error)]
pub enum HeadroomError {
    /// Not enough free space for the rewritten copy alongside the original.
    #[error("insufficient disk space: required {required}, available {available}")]
    InsufficientSpace {
        /// Bytes the rewrite is budgeted to need.
        required: u64,
        /// Free bytes observed on the target filesystem.
        available: u64,
    },
    /// The free-space probe itself failed.
    #[error("disk usage probe failed: {0}")]
    Probe(#[from] std::io::Error),
}

/// Check that the filesystem containing `path` can hold a full rewritten
/// copy of `data_size` live bytes next to the original.
///
/// The free-space reading is a point-in-time snapshot; the 2x budget is the
/// mitigation for the unavoidable check-then-act race. A failure is never
/// retried here — the next scheduled or forced attempt re-checks on its own.
pub(crate) fn ensure_headroom(
    disk: &dyn DiskUsage,
    path: &Path,
    data_size: u64,
) -> Result<(), HeadroomError> {
    let required = data_size.saturating_mul(2);
    let available = disk.free_space(path)?;
    if available < required {
        return Err(HeadroomError::InsufficientSpace {
            required,
            available,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{io, path::PathBuf};

    use super::*;

    struct FixedDisk(u64);

    impl DiskUsage for FixedDisk {
        fn free_space(&self, _path: &Path) -> io::Result<u64> {
            Ok(self.0)
        }
    }

    struct BrokenDisk;

    impl DiskUsage for BrokenDisk {
        fn free_space(&self, _path: &Path) -> io::Result<u64> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no such mount"))
        }
    }

    #[test]
    fn requires_twice_the_data_size() {
        let path = PathBuf::from("/data/bucket");
        assert!(ensure_headroom(&FixedDisk(200), &path, 100).is_ok());
        let err = ensure_headroom(&FixedDisk(199), &path, 100).unwrap_err();
        match err {
            HeadroomError::InsufficientSpace {
                required,
                available,
            } => {
                assert_eq!(required, 200);
                assert_eq!(available, 199);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn probe_failure_surfaces() {
        let err = ensure_headroom(&BrokenDisk, Path::new("/gone"), 1).unwrap_err();
        assert!(matches!(err, HeadroomError::Probe(_)));
    }
}
