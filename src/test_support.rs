//! Shared fixtures for module tests.

use crate::spot::{SPOT_SCHEMA_VERSION, SpotRecord};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use uuid::Uuid;

/// A fresh temp directory plus the path of a lockfile inside it.
///
/// The lockfile itself is not created; most tests only need the line of spot
/// records next to it.
pub(crate) fn lock_dir(lockfile_name: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let lockfile = tmp.path().join(lockfile_name);
    (tmp, lockfile)
}

/// Plant a peer's spot record with the given index and timestamp.
pub(crate) fn foreign_spot(lockfile: &Path, index: u64, timestamp: i64) -> Uuid {
    let token = Uuid::new_v4();
    let record = SpotRecord {
        version: SPOT_SCHEMA_VERSION,
        timestamp,
        token,
    };

    let name = format!(
        "{}.{}",
        lockfile.file_name().unwrap().to_str().unwrap(),
        index
    );
    std::fs::write(
        lockfile.with_file_name(name),
        serde_json::to_string(&record).unwrap(),
    )
    .unwrap();

    token
}

/// The sorted spot indices currently on disk for `lockfile`.
pub(crate) fn spot_indices(lockfile: &Path) -> Vec<u64> {
    let dir = lockfile.parent().unwrap();
    let prefix = format!("{}.", lockfile.file_name().unwrap().to_str().unwrap());

    let mut indices: Vec<u64> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| {
            let name = entry.unwrap().file_name();
            let name = name.to_str()?;
            name.strip_prefix(&prefix)?.parse().ok()
        })
        .collect();

    indices.sort_unstable();
    indices
}
