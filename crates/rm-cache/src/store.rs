//! The on-disk collection cache.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rm_common::{ConfigurationSnapshot, ErrorCategory};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::writer::write_atomic;

/// File holding the last collection time as epoch seconds.
pub const TIMESTAMP_FILE: &str = "last_collection.timestamp";

/// File holding the full aggregated payload.
pub const PAYLOAD_FILE: &str = "collected_data.json";

/// Suffix of per-module payload files.
pub const MODULE_FILE_SUFFIX: &str = "_cache.json";

/// Errors from cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cached JSON at {path} is invalid: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid module id for cache file name: {0:?}")]
    InvalidModuleId(String),
}

impl CacheError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::CacheIo
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The fixed cache root for this platform.
pub fn default_cache_dir() -> PathBuf {
    if cfg!(target_os = "macos") {
        PathBuf::from("/Library/Managed Reports/cache")
    } else {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("/var/cache"))
            .join("reportmate")
    }
}

/// Persists timestamps and payloads under one directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CacheStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn timestamp_path(&self) -> PathBuf {
        self.root.join(TIMESTAMP_FILE)
    }

    pub fn payload_path(&self) -> PathBuf {
        self.root.join(PAYLOAD_FILE)
    }

    pub fn module_path(&self, module_id: &str) -> Result<PathBuf, CacheError> {
        let valid = !module_id.is_empty()
            && module_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(CacheError::InvalidModuleId(module_id.to_string()));
        }
        Ok(self
            .root
            .join(format!("{}{}", module_id, MODULE_FILE_SUFFIX)))
    }

    /// Last recorded collection time in epoch seconds.
    ///
    /// A missing file is `None`. An unparseable file is also `None` (logged),
    /// so corruption never suppresses a collection.
    pub fn last_collection_time(&self) -> Result<Option<i64>, CacheError> {
        let path = self.timestamp_path();
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(&path, e)),
        };
        match content.trim().parse::<i64>() {
            Ok(ts) => Ok(Some(ts)),
            Err(_) => {
                warn!(path = %path.display(), "ignoring corrupt collection timestamp");
                Ok(None)
            }
        }
    }

    /// Record a collection time. Never moves the recorded time backwards.
    ///
    /// Returns the timestamp that is on disk afterwards.
    pub fn record_collection_time(&self, timestamp: i64) -> Result<i64, CacheError> {
        if let Some(existing) = self.last_collection_time()? {
            if existing > timestamp {
                debug!(existing, timestamp, "keeping newer recorded collection time");
                return Ok(existing);
            }
        }
        let path = self.timestamp_path();
        write_atomic(&path, timestamp.to_string().as_bytes())
            .map_err(|e| CacheError::io(&path, e))?;
        Ok(timestamp)
    }

    /// Whether a scheduled run should skip collection right now.
    pub fn should_skip(&self, snapshot: &ConfigurationSnapshot, force: bool) -> bool {
        self.should_skip_at(snapshot, force, Utc::now().timestamp())
    }

    /// Skip iff not forced, a prior timestamp exists, and less than the
    /// configured interval has elapsed since it.
    pub fn should_skip_at(&self, snapshot: &ConfigurationSnapshot, force: bool, now: i64) -> bool {
        if force {
            return false;
        }
        let last = match self.last_collection_time() {
            Ok(Some(ts)) => ts,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "cannot read collection timestamp; not skipping");
                return false;
            }
        };
        let elapsed = now.saturating_sub(last);
        let interval = i64::try_from(snapshot.collection_interval_secs).unwrap_or(i64::MAX);
        elapsed < interval
    }

    /// Persist the full payload.
    pub fn persist_payload(&self, payload: &Value) -> Result<(), CacheError> {
        let path = self.payload_path();
        self.write_json(&path, payload)?;
        info!(path = %path.display(), "cached collection payload");
        Ok(())
    }

    /// Load the last full payload, if any.
    pub fn load_payload(&self) -> Result<Option<Value>, CacheError> {
        self.read_json(&self.payload_path())
    }

    /// Persist one module's payload.
    pub fn persist_module_payload(&self, module_id: &str, payload: &Value) -> Result<(), CacheError> {
        let path = self.module_path(module_id)?;
        self.write_json(&path, payload)?;
        debug!(module = module_id, path = %path.display(), "cached module payload");
        Ok(())
    }

    /// Load one module's last payload, if any.
    pub fn load_module_payload(&self, module_id: &str) -> Result<Option<Value>, CacheError> {
        let path = self.module_path(module_id)?;
        self.read_json(&path)
    }

    fn write_json(&self, path: &Path, value: &Value) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| CacheError::Json {
            path: path.to_path_buf(),
            source: e,
        })?;
        write_atomic(path, &bytes).map_err(|e| CacheError::io(path, e))
    }

    fn read_json(&self, path: &Path) -> Result<Option<Value>, CacheError> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CacheError::Json {
                path: path.to_path_buf(),
                source: e,
            })
    }
}
