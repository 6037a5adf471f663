//! Age-based pruning of cached payloads.
//!
//! Pruning is best effort: a file that cannot be inspected or removed is
//! logged and counted, never surfaced as an error. The collection timestamp
//! is kept regardless of age since it gates scheduling rather than holding
//! collected data.

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::store::{CacheStore, TIMESTAMP_FILE};
use crate::writer::is_temp_file;

/// Default retention window for cached payloads.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Result of one pruning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Files deleted.
    pub removed: Vec<PathBuf>,
    /// Files that were eligible but could not be deleted.
    pub failed: Vec<PathBuf>,
}

impl PruneReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl CacheStore {
    /// Remove cache files whose modification time is older than `ttl`.
    pub fn prune_older_than(&self, ttl: Duration) -> PruneReport {
        self.prune_older_than_at(ttl, SystemTime::now())
    }

    /// Same as [`prune_older_than`](Self::prune_older_than) with an explicit
    /// reference time.
    pub fn prune_older_than_at(&self, ttl: Duration, now: SystemTime) -> PruneReport {
        let mut report = PruneReport::default();
        let entries = match fs::read_dir(self.root()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return report,
            Err(e) => {
                warn!(dir = %self.root().display(), error = %e, "cannot list cache directory");
                return report;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if entry.file_name() == TIMESTAMP_FILE {
                continue;
            }
            let modified = match entry.metadata().and_then(|m| {
                if m.is_file() {
                    m.modified().map(Some)
                } else {
                    Ok(None)
                }
            }) {
                Ok(Some(modified)) => modified,
                Ok(None) => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot stat cache file");
                    continue;
                }
            };

            // Files with a future mtime have age zero.
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age <= ttl {
                continue;
            }

            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(
                        path = %path.display(),
                        age_secs = age.as_secs(),
                        stale_temp = is_temp_file(&entry.file_name().to_string_lossy()),
                        "pruned cache file"
                    );
                    report.removed.push(path);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to prune cache file");
                    report.failed.push(path);
                }
            }
        }

        if !report.removed.is_empty() || !report.failed.is_empty() {
            info!(
                removed = report.removed.len(),
                failed = report.failed.len(),
                "cache pruning finished"
            );
        }
        report
    }
}
