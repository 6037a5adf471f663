//! The collection-cache-transmit pipeline.
//!
//! ```text
//! Idle → ResolvingConfig → CheckingCache → { Skipped | Collecting }
//!      → Aggregating → Caching → Transmitting → Done
//! ```
//!
//! `Error` is reachable from any phase. Caching always precedes
//! transmission, so a failed send can be retried by a transmit-only run
//! against the same cached payload. Collect-only stops after caching;
//! transmit-only jumps from `CheckingCache` straight to `Transmitting`.
//!
//! A run with an explicit module list only refreshes the per-module cache
//! files. The full payload and the collection timestamp belong to
//! configured-list runs, so an ad-hoc run never resets the interval gate.
//! A run that collects no module at all fails before caching.

use std::sync::Arc;

use chrono::Utc;
use rm_cache::{CacheStore, DEFAULT_RETENTION};
use rm_common::payload::{CollectionType, DeviceMetadata, METADATA_KEY};
use rm_common::{
    CollectionPayload, ConfigResolver, ConfigurationSnapshot, ErrorCategory, CLIENT_VERSION,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::collect::{platform, resolve_identity, ModuleRegistry};
use crate::exit_codes::ExitCode;
use crate::log_event;
use crate::logging::{event_names, LogContext, Stage};
use crate::query::{ProcessRunner, QueryEngine, SessionTimings};
use crate::transmit::{count_records, TransmissionError, TransmissionOutcome, Transmitter};

/// Pipeline phases in visiting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    ResolvingConfig,
    CheckingCache,
    Skipped,
    Collecting,
    Aggregating,
    Caching,
    Transmitting,
    Done,
    Error,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::ResolvingConfig => "resolving_config",
            Phase::CheckingCache => "checking_cache",
            Phase::Skipped => "skipped",
            Phase::Collecting => "collecting",
            Phase::Aggregating => "aggregating",
            Phase::Caching => "caching",
            Phase::Transmitting => "transmitting",
            Phase::Done => "done",
            Phase::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Caller choices for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Ignore the collection interval.
    pub force: bool,
    /// Stop after caching.
    pub collect_only: bool,
    /// Send the last cached payload without collecting.
    pub transmit_only: bool,
    /// Explicit module ids; None runs the configured list.
    pub modules: Option<Vec<String>>,
}

impl RunOptions {
    /// An explicit module selection is an ad-hoc run and bypasses the
    /// interval gate.
    pub fn bypasses_interval(&self) -> bool {
        self.force || self.modules.is_some()
    }
}

/// Why a run ended in `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RunError {
    #[error("no cached data to transmit")]
    NoCachedData,

    #[error("no module produced data (requested: {requested:?})")]
    NothingCollected { requested: Vec<String> },

    #[error("fatal configuration error: {0}")]
    FatalConfiguration(String),

    #[error("cache unreadable: {0}")]
    CacheUnreadable(String),

    #[error("transmission failed: {0}")]
    Transmission(TransmissionError),
}

impl RunError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            RunError::NoCachedData | RunError::CacheUnreadable(_) => ErrorCategory::CacheIo,
            RunError::FatalConfiguration(_) => ErrorCategory::FatalConfiguration,
            RunError::NothingCollected { .. } => ErrorCategory::QueryExecution,
            RunError::Transmission(_) => ErrorCategory::Transmission,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            RunError::NoCachedData => ExitCode::NoCachedData,
            RunError::NothingCollected { .. } => ExitCode::NothingCollected,
            RunError::FatalConfiguration(_) => ExitCode::ConfigError,
            RunError::CacheUnreadable(_) => ExitCode::IoError,
            RunError::Transmission(_) => ExitCode::TransmissionFailed,
        }
    }
}

/// Summary of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub device_id: String,
    pub final_phase: Phase,
    pub phases: Vec<Phase>,
    pub modules_collected: Vec<String>,
    pub modules_failed: Vec<String>,
    /// Whether the full payload was written to the cache. Always false for
    /// runs with an explicit module list.
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transmission: Option<TransmissionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

impl RunReport {
    fn new(ctx: &LogContext) -> Self {
        RunReport {
            run_id: ctx.run_id.clone(),
            device_id: ctx.device_id.clone(),
            final_phase: Phase::Idle,
            phases: vec![Phase::Idle],
            modules_collected: Vec::new(),
            modules_failed: Vec::new(),
            cached: false,
            transmission: None,
            error: None,
        }
    }

    fn enter(&mut self, phase: Phase) {
        self.phases.push(phase);
        self.final_phase = phase;
    }

    fn fail(mut self, error: RunError) -> Self {
        self.enter(Phase::Error);
        self.error = Some(error);
        self
    }

    pub fn visited(&self, phase: Phase) -> bool {
        self.phases.contains(&phase)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn exit_code(&self) -> ExitCode {
        self.error
            .as_ref()
            .map_or(ExitCode::Clean, RunError::exit_code)
    }

    /// One-line human summary for stdout.
    pub fn summary_line(&self) -> String {
        match (&self.error, &self.transmission) {
            (Some(e), _) => format!("FAILED [{}]: {}", self.run_id, e),
            (None, _) if self.final_phase == Phase::Skipped => format!(
                "SKIPPED [{}]: collection interval has not elapsed",
                self.run_id
            ),
            (None, Some(TransmissionOutcome::Success { records_processed, message })) => format!(
                "OK [{}]: {} record(s) transmitted ({})",
                self.run_id, records_processed, message
            ),
            (None, _) => format!(
                "OK [{}]: {} module(s) collected and cached",
                self.run_id,
                self.modules_collected.len()
            ),
        }
    }
}

/// Whether `url` is an absolute http(s) URL with a host.
pub fn is_http_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"));
    matches!(rest, Some(r) if !r.is_empty() && !r.starts_with('/'))
}

/// Drives one run of the pipeline.
pub struct CollectionOrchestrator {
    resolver: Arc<ConfigResolver>,
    cache: CacheStore,
    registry: ModuleRegistry,
    runner: Arc<dyn ProcessRunner>,
    transmitter: Box<dyn Transmitter>,
    session_timings: Option<SessionTimings>,
    ctx: LogContext,
}

impl CollectionOrchestrator {
    pub fn new(
        resolver: Arc<ConfigResolver>,
        cache: CacheStore,
        registry: ModuleRegistry,
        runner: Arc<dyn ProcessRunner>,
        transmitter: Box<dyn Transmitter>,
        ctx: LogContext,
    ) -> Self {
        CollectionOrchestrator {
            resolver,
            cache,
            registry,
            runner,
            transmitter,
            session_timings: None,
            ctx,
        }
    }

    /// Override the extension handshake timings.
    pub fn with_session_timings(mut self, timings: SessionTimings) -> Self {
        self.session_timings = Some(timings);
        self
    }

    pub fn context(&self) -> &LogContext {
        &self.ctx
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Execute the pipeline once. Never panics on recoverable failures; the
    /// report carries the outcome.
    pub fn run(&mut self, options: &RunOptions) -> RunReport {
        let mut report = RunReport::new(&self.ctx);
        log_event!(self.ctx, INFO, event_names::RUN_STARTED, Stage::Init, "run started",
            force = options.force, collect_only = options.collect_only,
            transmit_only = options.transmit_only);

        report.enter(Phase::ResolvingConfig);
        let snapshot = self.resolver.snapshot();
        if !snapshot.device_id.is_empty() {
            self.ctx.set_device_id(snapshot.device_id.clone());
            report.device_id = snapshot.device_id.clone();
        }
        log_event!(self.ctx, DEBUG, event_names::CONFIG_RESOLVED, Stage::Init, "configuration resolved",
            modules = snapshot.enabled_modules.len(), interval_secs = snapshot.collection_interval_secs);

        if let Err(e) = self.check_preconditions(&snapshot, options) {
            log_event!(self.ctx, ERROR, event_names::CONFIG_FATAL, Stage::Init, e.to_string());
            return self.finish(report.fail(e));
        }

        report.enter(Phase::CheckingCache);
        if options.transmit_only {
            let payload = match self.cache.load_payload() {
                Ok(Some(payload)) => payload,
                Ok(None) => return self.finish(report.fail(RunError::NoCachedData)),
                Err(e) => return self.finish(report.fail(RunError::CacheUnreadable(e.to_string()))),
            };
            log_event!(self.ctx, INFO, event_names::CACHE_LOADED, Stage::Cache, "loaded cached payload");
            if let Some(id) = payload
                .get(METADATA_KEY)
                .and_then(|m| m.get("deviceId"))
                .and_then(Value::as_str)
            {
                self.ctx.set_device_id(id);
                report.device_id = id.to_string();
            }
            report.cached = true;
            return self.transmit(report, &snapshot, &payload);
        }

        if self
            .cache
            .should_skip(&snapshot, options.bypasses_interval())
        {
            log_event!(self.ctx, INFO, event_names::CACHE_SKIP, Stage::Cache,
                "collection interval has not elapsed; skipping");
            report.enter(Phase::Skipped);
            return self.finish(report);
        }

        report.enter(Phase::Collecting);
        let module_ids = options
            .modules
            .clone()
            .unwrap_or_else(|| snapshot.enabled_modules.clone());
        let mut engine = QueryEngine::new(&snapshot, Arc::clone(&self.runner));
        if let Some(timings) = self.session_timings {
            engine = engine.with_session_timings(timings);
        }
        let collected = self.collect(&snapshot, &mut engine, &module_ids, &mut report);
        if collected.is_empty() {
            engine.shutdown();
            log_event!(self.ctx, ERROR, event_names::COLLECTION_EMPTY, Stage::Collect,
                "no module produced data; cache left unchanged",
                requested = module_ids.len());
            return self.finish(report.fail(RunError::NothingCollected {
                requested: module_ids,
            }));
        }

        report.enter(Phase::Aggregating);
        let identity = resolve_identity(&snapshot, &mut engine);
        engine.shutdown();
        drop(engine);
        self.ctx.set_device_id(identity.device_id.clone());
        report.device_id = identity.device_id.clone();

        let metadata = DeviceMetadata {
            device_id: identity.device_id,
            serial_number: identity.serial_number,
            collected_at: Utc::now(),
            client_version: CLIENT_VERSION.to_string(),
            platform: platform().to_string(),
            collection_type: if options.modules.is_some() {
                CollectionType::Partial
            } else {
                CollectionType::Full
            },
            enabled_modules: module_ids,
            run_id: self.ctx.run_id.clone(),
        };
        let mut payload = CollectionPayload::new(metadata);
        for (id, value) in &collected {
            payload.insert_module(id, value.clone());
        }
        let payload = match payload.to_value() {
            Ok(value) => value,
            Err(e) => {
                return self.finish(report.fail(RunError::Transmission(
                    TransmissionError::Encoding {
                        detail: e.to_string(),
                    },
                )))
            }
        };
        log_event!(self.ctx, INFO, event_names::PAYLOAD_BUILT, Stage::Aggregate, "payload built",
            modules = count_records(&payload));

        report.enter(Phase::Caching);
        report.cached = self.cache_payload(&payload, &collected, options);

        if options.collect_only {
            report.enter(Phase::Done);
            return self.finish(report);
        }

        self.transmit(report, &snapshot, &payload)
    }

    fn check_preconditions(
        &self,
        snapshot: &ConfigurationSnapshot,
        options: &RunOptions,
    ) -> Result<(), RunError> {
        if options.collect_only && options.transmit_only {
            return Err(RunError::FatalConfiguration(
                "collect-only and transmit-only are mutually exclusive".to_string(),
            ));
        }
        if options.collect_only {
            return Ok(());
        }
        if !snapshot.has_api_url() {
            return Err(RunError::FatalConfiguration("ApiUrl is not set".to_string()));
        }
        if !is_http_url(&snapshot.api_url) {
            return Err(RunError::FatalConfiguration(format!(
                "ApiUrl is not an http(s) URL: {}",
                snapshot.api_url
            )));
        }
        Ok(())
    }

    fn collect(
        &mut self,
        snapshot: &ConfigurationSnapshot,
        engine: &mut QueryEngine,
        module_ids: &[String],
        report: &mut RunReport,
    ) -> Vec<(String, Value)> {
        let selection = self.registry.select(module_ids);
        for id in &selection.unknown {
            log_event!(self.ctx, WARN, event_names::MODULE_UNKNOWN, Stage::Collect,
                "unknown module id; skipping", module = id.as_str());
            report.modules_failed.push(id.clone());
        }

        let mut collected = Vec::with_capacity(selection.modules.len());
        for processor in selection.modules {
            let id = processor.id().to_string();
            log_event!(self.ctx, DEBUG, event_names::MODULE_STARTED, Stage::Collect,
                "collecting module", module = id.as_str());
            match processor.collect(snapshot, engine) {
                Ok(value) => {
                    log_event!(self.ctx, INFO, event_names::MODULE_FINISHED, Stage::Collect,
                        "module collected", module = id.as_str());
                    report.modules_collected.push(id.clone());
                    collected.push((id, value));
                }
                Err(e) => {
                    log_event!(self.ctx, WARN, event_names::MODULE_FAILED, Stage::Collect,
                        "module failed; excluded from payload", module = id.as_str(),
                        error = %e);
                    report.modules_failed.push(id);
                }
            }
        }
        collected
    }

    /// Persist per-module blobs, then the full payload and the timestamp
    /// for configured-list runs. Cache failures are logged and never end
    /// the run.
    fn cache_payload(
        &self,
        payload: &Value,
        modules: &[(String, Value)],
        options: &RunOptions,
    ) -> bool {
        for (id, value) in modules {
            if let Err(e) = self.cache.persist_module_payload(id, value) {
                log_event!(self.ctx, WARN, event_names::CACHE_WRITE_FAILED, Stage::Cache,
                    "could not cache module payload", module = id.as_str(), error = %e);
            }
        }
        let full = options.modules.is_none();
        let cached = full && self.persist_full_payload(payload);
        if !full {
            log_event!(self.ctx, INFO, event_names::CACHE_WRITTEN, Stage::Cache,
                "module payloads cached; full payload and timestamp unchanged",
                modules = modules.len());
        }
        let pruned = self.cache.prune_older_than(DEFAULT_RETENTION);
        if !pruned.removed.is_empty() {
            log_event!(self.ctx, DEBUG, event_names::CACHE_PRUNED, Stage::Cache,
                "pruned expired cache files", removed = pruned.removed.len());
        }
        cached
    }

    fn persist_full_payload(&self, payload: &Value) -> bool {
        if let Err(e) = self.cache.persist_payload(payload) {
            log_event!(self.ctx, WARN, event_names::CACHE_WRITE_FAILED, Stage::Cache,
                "could not cache payload; continuing without cache", error = %e);
            return false;
        }
        match self.cache.record_collection_time(Utc::now().timestamp()) {
            Ok(recorded) => {
                log_event!(self.ctx, INFO, event_names::CACHE_WRITTEN, Stage::Cache,
                    "payload cached", timestamp = recorded);
            }
            Err(e) => {
                log_event!(self.ctx, WARN, event_names::CACHE_WRITE_FAILED, Stage::Cache,
                    "could not record collection time", error = %e);
            }
        }
        true
    }

    fn transmit(
        &self,
        mut report: RunReport,
        snapshot: &ConfigurationSnapshot,
        payload: &Value,
    ) -> RunReport {
        report.enter(Phase::Transmitting);
        log_event!(self.ctx, INFO, event_names::TRANSMIT_STARTED, Stage::Transmit,
            "transmitting payload");
        let outcome = self.transmitter.send(snapshot, payload);
        report.transmission = Some(outcome.clone());
        match outcome {
            TransmissionOutcome::Success {
                records_processed,
                message,
            } => {
                log_event!(self.ctx, INFO, event_names::TRANSMIT_FINISHED, Stage::Transmit,
                    message, records = records_processed);
                report.enter(Phase::Done);
                self.finish(report)
            }
            TransmissionOutcome::Failure { error } => {
                log_event!(self.ctx, ERROR, event_names::TRANSMIT_FAILED, Stage::Transmit,
                    "transmission failed; payload remains cached", error = %error);
                self.finish(report.fail(RunError::Transmission(error)))
            }
        }
    }

    fn finish(&self, report: RunReport) -> RunReport {
        match &report.error {
            None => {
                log_event!(self.ctx, INFO, event_names::RUN_FINISHED, Stage::Init, "run finished",
                    final_phase = %report.final_phase,
                    modules = report.modules_collected.len());
            }
            Some(e) => {
                log_event!(self.ctx, ERROR, event_names::RUN_FAILED, Stage::Init, "run failed",
                    error = %e, category = %e.category());
            }
        }
        report
    }
}
