//! Layered configuration resolution.
//!
//! Resolution is key-level: each key takes its value from the
//! highest-precedence source that defines it, and a source that omits a key
//! never clears a value resolved from a lower layer.
//!
//! The held snapshot is swapped as one `Arc` assignment under a write lock,
//! so concurrent readers see either the old or the new snapshot, never a
//! half-merged one.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tracing::{debug, warn};

use super::extension::ExtensionLocator;
use super::keys::ConfigKey;
use super::snapshot::{ConfigurationSnapshot, SnapshotBuilder};
use super::sources::{environment_source, load_plist_source, PartialConfig};
use super::{ConfigPaths, ConfigSource};
use crate::error::Result;

/// Resolves configuration from all six sources and holds the current snapshot.
#[derive(Debug)]
pub struct ConfigResolver {
    paths: ConfigPaths,
    environment: BTreeMap<String, String>,
    locator: ExtensionLocator,
    overrides: Mutex<PartialConfig>,
    current: RwLock<Arc<ConfigurationSnapshot>>,
}

impl ConfigResolver {
    /// Resolver over the given paths, reading the process environment.
    pub fn new(paths: ConfigPaths) -> Self {
        let environment = std::env::vars()
            .filter(|(k, _)| k.starts_with("REPORTMATE_"))
            .collect();
        Self::with_environment(paths, environment, ExtensionLocator::system())
    }

    /// Resolver with an explicit environment and extension locator.
    pub fn with_environment(
        paths: ConfigPaths,
        environment: BTreeMap<String, String>,
        locator: ExtensionLocator,
    ) -> Self {
        let resolver = ConfigResolver {
            paths,
            environment,
            locator,
            overrides: Mutex::new(PartialConfig::new()),
            current: RwLock::new(Arc::new(ConfigurationSnapshot::defaults())),
        };
        let snapshot = resolver.resolve(&PartialConfig::new());
        resolver.swap(snapshot);
        resolver
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<ConfigurationSnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// Build a fresh snapshot from every source plus the given overrides.
    ///
    /// Does not touch the held snapshot.
    pub fn resolve(&self, overrides: &PartialConfig) -> ConfigurationSnapshot {
        let mut builder = SnapshotBuilder::new();
        for (source, partial) in self.layers(overrides) {
            for (key, value) in &partial {
                if let Err(e) = builder.apply(source, *key, value) {
                    warn!(source = %source, key = %key, error = %e, "ignoring malformed value");
                }
            }
        }
        builder.finish(&self.locator)
    }

    /// Load every non-default layer, lowest precedence first.
    ///
    /// Unreadable files are logged and treated as empty.
    pub fn layers(&self, overrides: &PartialConfig) -> Vec<(ConfigSource, PartialConfig)> {
        let file_layer = |source: ConfigSource, path: &std::path::Path| {
            match load_plist_source(path) {
                Ok(partial) => {
                    debug!(source = %source, keys = partial.len(), "loaded configuration source");
                    partial
                }
                Err(e) => {
                    warn!(source = %source, error = %e, "skipping unreadable configuration source");
                    PartialConfig::new()
                }
            }
        };

        vec![
            (
                ConfigSource::UserFile,
                file_layer(ConfigSource::UserFile, &self.paths.user_file),
            ),
            (
                ConfigSource::SystemFile,
                file_layer(ConfigSource::SystemFile, &self.paths.system_file),
            ),
            (
                ConfigSource::ManagedProfile,
                file_layer(ConfigSource::ManagedProfile, &self.paths.managed_file),
            ),
            (
                ConfigSource::Environment,
                environment_source(|k| self.environment.get(k).cloned()),
            ),
            (ConfigSource::RuntimeOverride, overrides.clone()),
        ]
    }

    /// Set one runtime override and re-resolve.
    ///
    /// Returns the snapshot that replaced the previous one.
    pub fn set_override(&self, key: ConfigKey, value: Value) -> Arc<ConfigurationSnapshot> {
        let mut overrides = match self.overrides.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        overrides.insert(key, value);
        // Hold the override lock through the swap so two concurrent
        // overrides cannot publish out of order.
        let snapshot = Arc::new(self.resolve(&overrides));
        self.swap_arc(Arc::clone(&snapshot));
        snapshot
    }

    /// Set a runtime override by key name.
    pub fn set_override_named(&self, name: &str, value: Value) -> Result<Arc<ConfigurationSnapshot>> {
        let key: ConfigKey = name.parse()?;
        Ok(self.set_override(key, value))
    }

    /// Re-read every source with the current overrides.
    pub fn reload(&self) -> Arc<ConfigurationSnapshot> {
        let overrides = match self.overrides.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let snapshot = Arc::new(self.resolve(&overrides));
        self.swap_arc(Arc::clone(&snapshot));
        snapshot
    }

    fn swap(&self, snapshot: ConfigurationSnapshot) {
        self.swap_arc(Arc::new(snapshot));
    }

    fn swap_arc(&self, snapshot: Arc<ConfigurationSnapshot>) {
        match self.current.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver_in(dir: &std::path::Path, env: &[(&str, &str)]) -> ConfigResolver {
        ConfigResolver::with_environment(
            ConfigPaths::rooted_at(dir),
            env.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ExtensionLocator::none(),
        )
    }

    #[test]
    fn test_no_sources_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver_in(dir.path(), &[]);
        let snap = resolver.snapshot();
        assert_eq!(*snap, ConfigurationSnapshot::defaults());
    }

    #[test]
    fn test_environment_parsed_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver_in(
            dir.path(),
            &[
                ("REPORTMATE_COLLECTION_INTERVAL", "1800"),
                ("REPORTMATE_LOG_LEVEL", "debug"),
            ],
        );
        let snap = resolver.snapshot();
        assert_eq!(snap.collection_interval_secs, 1800);
        assert_eq!(snap.log_level, "debug");
        assert_eq!(
            snap.source_of(ConfigKey::CollectionInterval),
            ConfigSource::Environment
        );
    }

    #[test]
    fn test_malformed_environment_value_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver_in(dir.path(), &[("REPORTMATE_COLLECTION_INTERVAL", "hourly")]);
        assert_eq!(resolver.snapshot().collection_interval_secs, 3600);
    }

    #[test]
    fn test_set_override_replaces_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver_in(dir.path(), &[("REPORTMATE_DEVICE_ID", "from-env")]);
        let before = resolver.snapshot();
        assert_eq!(before.device_id, "from-env");

        let after = resolver.set_override(ConfigKey::DeviceId, json!("from-cli"));
        assert_eq!(after.device_id, "from-cli");
        assert_eq!(resolver.snapshot().device_id, "from-cli");
        // Old snapshot is untouched.
        assert_eq!(before.device_id, "from-env");
    }

    #[test]
    fn test_set_override_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver_in(dir.path(), &[]);
        let snap = resolver
            .set_override_named("EnabledModules", json!("network,hardware"))
            .unwrap();
        assert_eq!(snap.enabled_modules, vec!["network", "hardware"]);
        assert!(resolver.set_override_named("Bogus", json!(1)).is_err());
    }

    #[test]
    fn test_concurrent_readers_see_whole_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = Arc::new(resolver_in(dir.path(), &[]));

        let writer = {
            let resolver = Arc::clone(&resolver);
            std::thread::spawn(move || {
                for i in 1..50u64 {
                    resolver.set_override(ConfigKey::Timeout, json!(i));
                }
            })
        };

        for _ in 0..200 {
            let snap = resolver.snapshot();
            let from_override = snap.source_of(ConfigKey::Timeout) == ConfigSource::RuntimeOverride;
            assert_eq!(from_override, snap.timeout_secs < 50);
        }
        writer.join().unwrap();
        assert_eq!(resolver.snapshot().timeout_secs, 49);
    }
}
