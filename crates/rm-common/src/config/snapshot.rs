//! The immutable, fully-populated configuration snapshot.
//!
//! A snapshot is produced by folding every source, lowest precedence first,
//! into a [`SnapshotBuilder`] that starts from built-in defaults. Every field
//! always has a value; collaborators never see a partial configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use super::extension::ExtensionLocator;
use super::keys::{
    coerce_bool, coerce_log_level, coerce_module_list, coerce_positive_int, coerce_string,
    ConfigKey,
};
use super::ConfigSource;
use crate::error::Error;

pub const DEFAULT_COLLECTION_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_OSQUERY_PATH: &str = "/usr/local/bin/osqueryi";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Module ids enabled when no source says otherwise.
pub const DEFAULT_MODULES: [&str; 8] = [
    "hardware",
    "system",
    "network",
    "security",
    "applications",
    "management",
    "inventory",
    "peripherals",
];

/// One fully-resolved configuration value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigurationSnapshot {
    /// Base URL of the collection API, without trailing slash. Empty = unset.
    pub api_url: String,
    /// Explicit device id. Empty = derive from the hardware serial.
    pub device_id: String,
    /// Shared secret for the collection API. Empty = no auth headers.
    #[serde(skip_serializing)]
    pub api_key: String,
    pub collection_interval_secs: u64,
    pub log_level: String,
    /// Ordered, de-duplicated module ids.
    pub enabled_modules: Vec<String>,
    pub osquery_path: PathBuf,
    pub extension_enabled: bool,
    /// Resolved extension file; None when no candidate exists or the
    /// extension is disabled.
    pub extension_path: Option<PathBuf>,
    pub validate_ssl: bool,
    pub timeout_secs: u64,
    /// Which source supplied each key's effective value.
    pub provenance: BTreeMap<ConfigKey, ConfigSource>,
}

impl ConfigurationSnapshot {
    /// Snapshot of built-in defaults with the extension tier disabled.
    pub fn defaults() -> Self {
        SnapshotBuilder::new().finish(&ExtensionLocator::none())
    }

    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.collection_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn has_api_url(&self) -> bool {
        !self.api_url.is_empty()
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Extension path to use, honoring the enable flag.
    pub fn active_extension(&self) -> Option<&Path> {
        if self.extension_enabled {
            self.extension_path.as_deref()
        } else {
            None
        }
    }

    /// API key with all but the last four characters masked.
    pub fn masked_api_key(&self) -> String {
        let n = self.api_key.chars().count();
        if n == 0 {
            return String::new();
        }
        if n <= 4 {
            return "*".repeat(n);
        }
        let tail: String = self.api_key.chars().skip(n - 4).collect();
        format!("{}{}", "*".repeat(n - 4), tail)
    }

    /// Source that supplied a key's value.
    pub fn source_of(&self, key: ConfigKey) -> ConfigSource {
        self.provenance
            .get(&key)
            .copied()
            .unwrap_or(ConfigSource::Defaults)
    }

    /// Display form with the secret masked, for diagnostics.
    pub fn to_display_json(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(ref mut map) = value {
            map.insert("api_key".to_string(), Value::String(self.masked_api_key()));
        }
        value
    }
}

/// Accumulates key-level overrides on top of defaults.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotBuilder {
    api_url: String,
    device_id: String,
    api_key: String,
    collection_interval_secs: u64,
    log_level: String,
    enabled_modules: Vec<String>,
    osquery_path: PathBuf,
    extension_enabled: bool,
    extension_path: String,
    validate_ssl: bool,
    timeout_secs: u64,
    provenance: BTreeMap<ConfigKey, ConfigSource>,
}

impl SnapshotBuilder {
    pub(crate) fn new() -> Self {
        SnapshotBuilder {
            api_url: String::new(),
            device_id: String::new(),
            api_key: String::new(),
            collection_interval_secs: DEFAULT_COLLECTION_INTERVAL_SECS,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            enabled_modules: DEFAULT_MODULES.iter().map(|m| m.to_string()).collect(),
            osquery_path: PathBuf::from(DEFAULT_OSQUERY_PATH),
            extension_enabled: true,
            extension_path: String::new(),
            validate_ssl: true,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            provenance: ConfigKey::ALL
                .iter()
                .map(|k| (*k, ConfigSource::Defaults))
                .collect(),
        }
    }

    /// Apply one key from one source. On error the prior value is kept.
    pub(crate) fn apply(
        &mut self,
        source: ConfigSource,
        key: ConfigKey,
        value: &Value,
    ) -> Result<(), Error> {
        match key {
            ConfigKey::ApiUrl => {
                self.api_url = coerce_string(key, value)?.trim_end_matches('/').to_string()
            }
            ConfigKey::DeviceId => self.device_id = coerce_string(key, value)?,
            ConfigKey::ApiKey => self.api_key = coerce_string(key, value)?,
            ConfigKey::CollectionInterval => {
                self.collection_interval_secs = coerce_positive_int(key, value)?
            }
            ConfigKey::LogLevel => self.log_level = coerce_log_level(key, value)?,
            ConfigKey::EnabledModules => self.enabled_modules = coerce_module_list(key, value)?,
            ConfigKey::OsqueryPath => {
                let path = coerce_string(key, value)?;
                if path.is_empty() {
                    return Err(Error::InvalidValue {
                        key: key.name().to_string(),
                        reason: "path is empty".to_string(),
                    });
                }
                self.osquery_path = PathBuf::from(path);
            }
            ConfigKey::ValidateSsl => self.validate_ssl = coerce_bool(key, value)?,
            ConfigKey::Timeout => self.timeout_secs = coerce_positive_int(key, value)?,
            ConfigKey::OsqueryExtensionEnabled => {
                self.extension_enabled = coerce_bool(key, value)?
            }
            ConfigKey::OsqueryExtensionPath => self.extension_path = coerce_string(key, value)?,
        }
        self.provenance.insert(key, source);
        Ok(())
    }

    pub(crate) fn finish(self, locator: &ExtensionLocator) -> ConfigurationSnapshot {
        let extension_path = if self.extension_enabled {
            let configured = (!self.extension_path.is_empty())
                .then(|| PathBuf::from(&self.extension_path));
            locator.locate(configured.as_deref())
        } else {
            None
        };

        ConfigurationSnapshot {
            api_url: self.api_url,
            device_id: self.device_id,
            api_key: self.api_key,
            collection_interval_secs: self.collection_interval_secs,
            log_level: self.log_level,
            enabled_modules: self.enabled_modules,
            osquery_path: self.osquery_path,
            extension_enabled: self.extension_enabled,
            extension_path,
            validate_ssl: self.validate_ssl,
            timeout_secs: self.timeout_secs,
            provenance: self.provenance,
        }
    }
}
