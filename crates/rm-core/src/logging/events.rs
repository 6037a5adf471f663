//! Structured event vocabulary for logging.
//!
//! Every run-level record carries the correlation fields of a
//! [`LogContext`] plus a [`Stage`] and a stable event name.

use serde::{Deserialize, Serialize};

/// Pipeline stages, used as the `stage` field of log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Startup, argument handling, configuration resolution.
    Init,
    /// Interval gate and cache persistence.
    Cache,
    /// Module collection.
    Collect,
    /// Payload assembly and device identity.
    Aggregate,
    /// Upload to the collection API.
    Transmit,
    /// Query tool and extension session.
    Query,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::Cache => "cache",
            Stage::Collect => "collect",
            Stage::Aggregate => "aggregate",
            Stage::Transmit => "transmit",
            Stage::Query => "query",
        };
        write!(f, "{}", s)
    }
}

/// Standard event names used in logging.
pub mod event_names {
    // Run lifecycle
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_FINISHED: &str = "run.finished";
    pub const RUN_FAILED: &str = "run.failed";

    // Config
    pub const CONFIG_RESOLVED: &str = "config.resolved";
    pub const CONFIG_FATAL: &str = "config.fatal";

    // Cache
    pub const CACHE_SKIP: &str = "cache.skip";
    pub const CACHE_WRITTEN: &str = "cache.written";
    pub const CACHE_WRITE_FAILED: &str = "cache.write_failed";
    pub const CACHE_LOADED: &str = "cache.loaded";
    pub const CACHE_PRUNED: &str = "cache.pruned";

    // Collect
    pub const MODULE_STARTED: &str = "module.started";
    pub const MODULE_FINISHED: &str = "module.finished";
    pub const MODULE_FAILED: &str = "module.failed";
    pub const MODULE_UNKNOWN: &str = "module.unknown";
    pub const COLLECTION_EMPTY: &str = "collection.empty";

    // Aggregate
    pub const PAYLOAD_BUILT: &str = "payload.built";

    // Transmit
    pub const TRANSMIT_STARTED: &str = "transmit.started";
    pub const TRANSMIT_FINISHED: &str = "transmit.finished";
    pub const TRANSMIT_FAILED: &str = "transmit.failed";
}

/// Correlation fields carried by every run-level log record.
///
/// One context is created per run and handed to the orchestrator; nothing
/// about it is process-global.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogContext {
    pub run_id: String,
    /// Empty until the device id is known.
    pub device_id: String,
}

impl LogContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        LogContext {
            run_id: run_id.into(),
            device_id: String::new(),
        }
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    pub fn set_device_id(&mut self, device_id: impl Into<String>) {
        self.device_id = device_id.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_serialization() {
        assert_eq!(serde_json::to_string(&Stage::Collect).unwrap(), "\"collect\"");
        assert_eq!(Stage::Transmit.to_string(), "transmit");
    }

    #[test]
    fn test_context_device_id() {
        let mut ctx = LogContext::new("run-abc");
        assert!(ctx.device_id.is_empty());
        ctx.set_device_id("dev-1");
        assert_eq!(ctx, LogContext::new("run-abc").with_device_id("dev-1"));
    }
}
