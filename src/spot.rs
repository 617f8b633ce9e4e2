//! Spot records: the on-disk waiting line for a lockfile.
//!
//! Every process waiting on a lockfile `<dir>/<name>` reserves a position by
//! writing a record file `<dir>/<name>.<N>` where `<N>` is its decimal spot
//! index. The record body is a single JSON object:
//!
//! ```json
//! {"version":1,"timestamp":1722600000,"token":"0189f7e2-..."}
//! ```
//!
//! - `timestamp`: epoch seconds at last write; a record older than the spot
//!   lifetime is abandoned and may be deleted by any participant.
//! - `token`: random 128-bit identifier binding the record to the process
//!   that wrote it.
//!
//! The `version` field is carried so future revisions can coexist in a shared
//! directory; any record whose `timestamp` and `token` decode is honored.
//! Records are world-writable where possible so peers running as other users
//! can refresh the line.

use crate::error::{Result, TurnstileError};
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Current spot record schema version.
pub const SPOT_SCHEMA_VERSION: u32 = 1;

/// Epoch seconds right now.
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// The serialized payload of a spot record file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotRecord {
    /// Schema version of this record.
    pub version: u32,

    /// Epoch seconds at last write.
    pub timestamp: i64,

    /// Random identifier binding the record to its writer.
    pub token: Uuid,
}

/// Why a record file could not be read back.
#[derive(Debug)]
pub enum SpotReadError {
    /// The file disappeared between listing and opening.
    Vanished,
    /// The file exists but does not decode as a spot record.
    Corrupt(String),
}

impl SpotRecord {
    /// Create a fresh record for `token`, stamped with the current time.
    pub fn new(token: Uuid) -> Self {
        Self {
            version: SPOT_SCHEMA_VERSION,
            timestamp: now_secs(),
            token,
        }
    }

    /// Parse the on-disk JSON form.
    pub fn from_json(json: &str) -> std::result::Result<Self, SpotReadError> {
        serde_json::from_str(json).map_err(|e| SpotReadError::Corrupt(e.to_string()))
    }

    /// Read and decode a record file.
    pub fn read(path: &Path) -> std::result::Result<Self, SpotReadError> {
        let content = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SpotReadError::Vanished
            } else {
                SpotReadError::Corrupt(e.to_string())
            }
        })?;

        Self::from_json(&content)
    }

    /// Whether the record has outlived `lifetime_secs` as of `now`.
    ///
    /// Records stamped in the future count as live; lifetime slack is how
    /// moderate clock skew between hosts is absorbed.
    pub fn is_expired(&self, lifetime_secs: i64, now: i64) -> bool {
        self.timestamp + lifetime_secs < now
    }
}

/// An immutable snapshot of a peer's record as found on disk.
///
/// Views are advisory: the timestamp may already be stale by the time the
/// caller looks at it, and the file may already be gone.
#[derive(Debug, Clone)]
pub struct SpotView {
    /// On-disk path of the record file.
    pub path: PathBuf,

    /// Position in line, parsed from the filename suffix.
    pub index: u64,

    /// Epoch seconds at the record's last write.
    pub timestamp: i64,

    /// The writer's token.
    pub token: Uuid,
}

/// Enumerates the waiting line of one lockfile and cleans dead records.
#[derive(Debug)]
pub struct SpotScanner {
    lockfile: PathBuf,
    dir: PathBuf,
    file_name: String,
    pattern: Regex,
}

impl SpotScanner {
    /// Build a scanner for `lockfile`, canonicalizing its parent directory.
    ///
    /// Fails with [`TurnstileError::LockDir`] when the parent directory does
    /// not exist: there is nowhere to queue.
    pub fn new(lockfile: &Path) -> Result<Self> {
        let file_name = lockfile
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
            .ok_or_else(|| {
                TurnstileError::Usage(format!(
                    "lockfile path '{}' has no usable file name",
                    lockfile.display()
                ))
            })?;

        let parent = match lockfile.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        let dir = fs::canonicalize(parent).map_err(|source| TurnstileError::LockDir {
            path: lockfile.to_path_buf(),
            source,
        })?;

        // Anchored so siblings like "name.5.bak" never parse as spots.
        let pattern = Regex::new(&format!(r"^{}\.([0-9]+)$", regex::escape(&file_name)))
            .expect("escaped spot filename pattern is a valid regex");

        Ok(Self {
            lockfile: dir.join(&file_name),
            dir,
            file_name,
            pattern,
        })
    }

    /// The canonicalized lockfile path this scanner serves.
    pub fn lockfile(&self) -> &Path {
        &self.lockfile
    }

    /// The path a record with `index` would occupy.
    pub fn spot_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("{}.{}", self.file_name, index))
    }

    /// Parse the spot index out of a directory entry name, if it is one.
    pub fn spot_index(&self, entry_name: &str) -> Option<u64> {
        self.pattern
            .captures(entry_name)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
    }

    /// Enumerate all live spot records for this lockfile.
    ///
    /// Expired and undecodable records are deleted best-effort and excluded
    /// from the result; a record that vanishes mid-scan is skipped silently.
    /// Every view in the returned map was live at the moment it was read.
    pub fn scan(&self, lifetime_secs: i64) -> Result<BTreeMap<PathBuf, SpotView>> {
        let entries = fs::read_dir(&self.dir).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                TurnstileError::LockDir {
                    path: self.lockfile.clone(),
                    source,
                }
            } else {
                TurnstileError::Runtime(format!(
                    "failed to list lock directory '{}': {}",
                    self.dir.display(),
                    source
                ))
            }
        })?;

        let now = now_secs();
        let mut result = BTreeMap::new();

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    return Err(TurnstileError::Runtime(format!(
                        "failed to read lock directory entry in '{}': {}",
                        self.dir.display(),
                        e
                    )));
                }
            };

            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }

            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            let Some(index) = self.spot_index(name) else {
                continue;
            };

            let path = entry.path();

            match SpotRecord::read(&path) {
                Ok(record) => {
                    if record.is_expired(lifetime_secs, now) {
                        tracing::debug!(spot = %path.display(), "removing expired spot record");
                        let _ = fs::remove_file(&path);
                        continue;
                    }

                    let view = SpotView {
                        path,
                        index,
                        timestamp: record.timestamp,
                        token: record.token,
                    };
                    result.insert(view.path.clone(), view);
                }
                Err(SpotReadError::Vanished) => continue,
                Err(SpotReadError::Corrupt(reason)) => {
                    tracing::warn!(
                        spot = %path.display(),
                        reason = %reason,
                        "deleting broken spot record"
                    );
                    let _ = fs::remove_file(&path);
                }
            }
        }

        Ok(result)
    }
}

/// Write `record` to `path` with exclusive-create semantics.
///
/// Fails with `AlreadyExists` when another process claimed the same index
/// first. The file is made world-writable best-effort so peers running as
/// other users can reap it once expired.
pub fn write_record_exclusive(path: &Path, record: &SpotRecord) -> std::io::Result<()> {
    let json = serde_json::to_string(record).map_err(std::io::Error::other)?;

    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;

    if let Err(e) = file.write_all(json.as_bytes()).and_then(|_| file.sync_all()) {
        let _ = fs::remove_file(path);
        return Err(e);
    }

    set_permissive_mode(path);
    Ok(())
}

/// Rewrite an existing record file in place.
///
/// The file is deliberately not created when missing: a vanished record means
/// the writer lost its position and must re-queue instead of silently
/// resurrecting a reaped spot.
pub fn rewrite_record(path: &Path, record: &SpotRecord) -> std::io::Result<()> {
    let json = serde_json::to_string(record).map_err(std::io::Error::other)?;

    let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
    file.write_all(json.as_bytes())
}

/// Make `path` readable and writable by everyone, ignoring failure.
///
/// On shared multi-user hosts another user may need to refresh or reap the
/// file; if the chmod fails the protocol still works for same-user peers.
#[cfg(unix)]
pub fn set_permissive_mode(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o666)) {
        tracing::debug!(path = %path.display(), error = %e, "failed to relax file permissions");
    }
}

#[cfg(not(unix))]
pub fn set_permissive_mode(_path: &Path) {}
