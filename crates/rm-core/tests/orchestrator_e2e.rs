//! End-to-end runs of the orchestrator with a scripted query tool and a
//! recording transmitter.

mod common;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use common::{fake_tool, FakeRunner, FakeTransmitter, Reply};
use rm_cache::CacheStore;
use rm_common::config::{ConfigPaths, ConfigResolver, ExtensionLocator};
use rm_common::ConfigKey;
use rm_core::collect::{device_id_for_serial, ModuleError, ModuleProcessor, ModuleRegistry};
use rm_core::exit_codes::ExitCode;
use rm_core::logging::LogContext;
use rm_core::query::QueryEngine;
use rm_core::transmit::{TransmissionError, TransmissionOutcome};
use rm_core::{CollectionOrchestrator, Phase, RunError, RunOptions};
use serde_json::{json, Value};

const SERIAL: &str = "C02TEST123";

fn respond(sql: &str) -> Reply {
    if sql.contains("hardware_serial FROM system_info") && !sql.contains("cpu_brand") {
        Reply::Rows(json!([{ "hardware_serial": SERIAL }]))
    } else if sql.contains("osquery_registry") {
        Reply::Rows(json!([]))
    } else {
        Reply::Rows(json!([{ "value": "x" }]))
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    resolver: Arc<ConfigResolver>,
    runner: Arc<FakeRunner>,
    transmitter: FakeTransmitter,
    cache_dir: std::path::PathBuf,
}

impl Harness {
    fn new(api_url: Option<&str>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(dir.path());
        let mut env = BTreeMap::new();
        env.insert(
            "REPORTMATE_OSQUERY_PATH".to_string(),
            tool.display().to_string(),
        );
        if let Some(url) = api_url {
            env.insert("REPORTMATE_API_URL".to_string(), url.to_string());
        }
        let resolver = Arc::new(ConfigResolver::with_environment(
            ConfigPaths::rooted_at(&dir.path().join("prefs")),
            env,
            ExtensionLocator::none(),
        ));
        resolver.set_override(ConfigKey::EnabledModules, json!(["hardware", "network"]));

        Harness {
            runner: Arc::new(FakeRunner::new(&tool, respond)),
            cache_dir: dir.path().join("cache"),
            resolver,
            transmitter: FakeTransmitter::new(),
            _dir: dir,
        }
    }

    fn cache(&self) -> CacheStore {
        CacheStore::new(&self.cache_dir)
    }

    fn orchestrator(&self, registry: ModuleRegistry) -> CollectionOrchestrator {
        CollectionOrchestrator::new(
            Arc::clone(&self.resolver),
            self.cache(),
            registry,
            self.runner.clone(),
            Box::new(self.transmitter.clone()),
            LogContext::new("run-e2e"),
        )
    }

    fn run(&self, options: RunOptions) -> rm_core::RunReport {
        self.orchestrator(ModuleRegistry::builtin()).run(&options)
    }
}

fn keys(value: &Value) -> Vec<&str> {
    let mut keys: Vec<_> = value
        .as_object()
        .unwrap()
        .keys()
        .map(String::as_str)
        .collect();
    keys.sort_unstable();
    keys
}

#[test]
fn collect_only_caches_modules_without_transmitting() {
    let h = Harness::new(None);
    let report = h.run(RunOptions {
        collect_only: true,
        ..RunOptions::default()
    });

    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(report.final_phase, Phase::Done);
    assert!(report.visited(Phase::Caching));
    assert!(!report.visited(Phase::Transmitting));
    assert_eq!(report.modules_collected, vec!["hardware", "network"]);
    assert!(report.cached);
    assert!(h.transmitter.sent().is_empty());

    let cached = h.cache().load_payload().unwrap().expect("payload cached");
    assert_eq!(keys(&cached), vec!["hardware", "metadata", "network"]);
    assert_eq!(cached["metadata"]["deviceId"], device_id_for_serial(SERIAL));
    assert_eq!(cached["metadata"]["serialNumber"], SERIAL);
    assert_eq!(cached["metadata"]["collectionType"], "full");
    assert!(h.cache().load_module_payload("hardware").unwrap().is_some());
    assert!(h.cache().last_collection_time().unwrap().is_some());
}

#[test]
fn transmit_only_without_cache_fails_before_network() {
    let h = Harness::new(Some("https://reportmate.example.test"));
    let report = h.run(RunOptions {
        transmit_only: true,
        ..RunOptions::default()
    });

    assert_eq!(report.error, Some(RunError::NoCachedData));
    assert_eq!(report.final_phase, Phase::Error);
    assert_eq!(report.exit_code(), ExitCode::NoCachedData);
    assert!(h.transmitter.sent().is_empty());
    assert_eq!(h.runner.tool_activity(), 0);
}

#[test]
fn full_run_transmits_cached_payload() {
    let h = Harness::new(Some("https://reportmate.example.test"));
    let report = h.run(RunOptions::default());

    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(
        report.phases,
        vec![
            Phase::Idle,
            Phase::ResolvingConfig,
            Phase::CheckingCache,
            Phase::Collecting,
            Phase::Aggregating,
            Phase::Caching,
            Phase::Transmitting,
            Phase::Done,
        ]
    );
    let sent = h.transmitter.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(Some(&sent[0]), h.cache().load_payload().unwrap().as_ref());
    assert_eq!(report.device_id, device_id_for_serial(SERIAL));
}

#[test]
fn second_run_within_interval_is_skipped_unless_forced() {
    let h = Harness::new(Some("https://reportmate.example.test"));
    assert!(h.run(RunOptions::default()).is_success());

    let skipped = h.run(RunOptions::default());
    assert_eq!(skipped.final_phase, Phase::Skipped);
    assert_eq!(skipped.exit_code(), ExitCode::Clean);
    assert_eq!(h.transmitter.sent().len(), 1);

    let forced = h.run(RunOptions {
        force: true,
        ..RunOptions::default()
    });
    assert_eq!(forced.final_phase, Phase::Done);
    assert_eq!(h.transmitter.sent().len(), 2);
}

#[test]
fn failed_transmission_can_be_retried_from_cache() {
    let mut h = Harness::new(Some("https://reportmate.example.test"));
    h.transmitter = FakeTransmitter::new()
        .then(TransmissionOutcome::failure(TransmissionError::Transport {
            detail: "connection refused".into(),
        }))
        .then(TransmissionOutcome::success(2, "stored"));

    let failed = h.run(RunOptions::default());
    assert!(matches!(failed.error, Some(RunError::Transmission(_))));
    assert_eq!(failed.exit_code(), ExitCode::TransmissionFailed);
    assert!(failed.cached);

    let activity = h.runner.tool_activity();
    let retried = h.run(RunOptions {
        transmit_only: true,
        ..RunOptions::default()
    });
    assert!(retried.is_success(), "{:?}", retried.error);
    assert!(!retried.visited(Phase::Collecting));
    assert_eq!(h.runner.tool_activity(), activity);

    let sent = h.transmitter.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], sent[1]);
    assert_eq!(retried.device_id, device_id_for_serial(SERIAL));
}

struct Exploding;

impl ModuleProcessor for Exploding {
    fn id(&self) -> &str {
        "network"
    }

    fn collect(
        &self,
        _snapshot: &rm_common::ConfigurationSnapshot,
        _engine: &mut QueryEngine,
    ) -> Result<Value, ModuleError> {
        Err(ModuleError::Failed {
            module: "network".into(),
            reason: "parser blew up".into(),
        })
    }
}

#[test]
fn failing_and_unknown_modules_are_excluded() {
    let h = Harness::new(None);
    let mut registry = ModuleRegistry::builtin();
    registry.register(Box::new(Exploding));

    let report = h.orchestrator(registry).run(&RunOptions {
        collect_only: true,
        modules: Some(vec!["hardware".into(), "network".into(), "bogus".into()]),
        ..RunOptions::default()
    });

    assert!(report.is_success());
    assert_eq!(report.modules_collected, vec!["hardware"]);
    assert_eq!(report.modules_failed, vec!["bogus", "network"]);
    assert!(!report.cached);
    assert!(h.cache().load_module_payload("hardware").unwrap().is_some());
    assert!(h.cache().load_module_payload("network").unwrap().is_none());
    assert!(h.cache().load_payload().unwrap().is_none());
    assert_eq!(h.cache().last_collection_time().unwrap(), None);
}

#[test]
fn explicit_module_run_keeps_full_payload_and_interval() {
    let h = Harness::new(Some("https://reportmate.example.test"));
    assert!(h
        .run(RunOptions {
            collect_only: true,
            ..RunOptions::default()
        })
        .is_success());
    let full = h.cache().load_payload().unwrap().unwrap();
    // Last scheduled collection long ago.
    std::fs::write(h.cache().timestamp_path(), "1").unwrap();

    let partial = h.run(RunOptions {
        modules: Some(vec!["hardware".into()]),
        ..RunOptions::default()
    });
    assert!(partial.is_success(), "{:?}", partial.error);
    assert!(!partial.cached);
    let sent = h.transmitter.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(keys(&sent[0]), vec!["hardware", "metadata"]);
    assert_eq!(sent[0]["metadata"]["collectionType"], "partial");

    assert_eq!(h.cache().load_payload().unwrap(), Some(full));
    assert_eq!(h.cache().last_collection_time().unwrap(), Some(1));

    let scheduled = h.run(RunOptions::default());
    assert!(scheduled.visited(Phase::Collecting));
    assert_eq!(scheduled.final_phase, Phase::Done);
    let cached = h.cache().load_payload().unwrap().unwrap();
    assert_eq!(cached["metadata"]["collectionType"], "full");
    assert!(h.cache().last_collection_time().unwrap() > Some(1));
}

#[test]
fn run_that_collects_nothing_fails_without_touching_cache() {
    let h = Harness::new(None);
    assert!(h
        .run(RunOptions {
            collect_only: true,
            ..RunOptions::default()
        })
        .is_success());
    let full = h.cache().load_payload().unwrap().unwrap();
    let recorded = h.cache().last_collection_time().unwrap();

    let report = h.run(RunOptions {
        collect_only: true,
        modules: Some(vec!["bogus".into()]),
        ..RunOptions::default()
    });
    assert!(!report.is_success());
    assert_eq!(report.final_phase, Phase::Error);
    assert!(!report.visited(Phase::Caching));
    assert_eq!(
        report.error,
        Some(RunError::NothingCollected {
            requested: vec!["bogus".into()]
        })
    );
    assert_eq!(report.exit_code(), ExitCode::NothingCollected);
    assert_ne!(report.exit_code().as_i32(), 0);
    assert_eq!(h.cache().load_payload().unwrap(), Some(full));
    assert_eq!(h.cache().last_collection_time().unwrap(), recorded);
}

#[test]
fn configured_list_with_no_usable_module_records_no_timestamp() {
    let h = Harness::new(None);
    h.resolver
        .set_override(ConfigKey::EnabledModules, json!(["bogus"]));

    let report = h.run(RunOptions {
        collect_only: true,
        ..RunOptions::default()
    });
    assert_eq!(report.exit_code(), ExitCode::NothingCollected);
    assert!(!report.cached);
    assert_eq!(h.cache().last_collection_time().unwrap(), None);
    assert!(h.cache().load_payload().unwrap().is_none());

    // The next scheduled run is not gated by the failed one.
    let again = h.run(RunOptions {
        collect_only: true,
        ..RunOptions::default()
    });
    assert!(again.visited(Phase::Collecting));
}

#[test]
fn missing_api_url_is_fatal_before_collection() {
    let h = Harness::new(None);
    let report = h.run(RunOptions::default());

    assert!(matches!(report.error, Some(RunError::FatalConfiguration(_))));
    assert_eq!(report.exit_code(), ExitCode::ConfigError);
    assert!(!report.visited(Phase::Collecting));
    assert_eq!(h.runner.tool_activity(), 0);
    assert!(!Path::new(&h.cache_dir).join("collected_data.json").exists());
}
