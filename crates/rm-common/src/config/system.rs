//! Write-only persistence of machine-wide configuration.
//!
//! This does not go through the merge path: it serializes a fixed key set to
//! the system-wide preference file, creating parent directories as needed.
//! The file is written to a temporary sibling and renamed into place.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde_json::{json, Value};
use tracing::info;

use super::keys::ConfigKey;
use super::snapshot::ConfigurationSnapshot;
use super::sources::json_to_plist;
use crate::error::{Error, Result};

/// The fixed key set written to the system preference file.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemConfiguration {
    pub api_url: String,
    pub api_key: String,
    pub device_id: String,
    pub collection_interval_secs: u64,
    pub log_level: String,
    pub enabled_modules: Vec<String>,
    pub osquery_path: String,
    pub validate_ssl: bool,
    pub timeout_secs: u64,
}

impl SystemConfiguration {
    /// Seed from a resolved snapshot, so unchanged keys keep their values.
    pub fn from_snapshot(snapshot: &ConfigurationSnapshot) -> Self {
        SystemConfiguration {
            api_url: snapshot.api_url.clone(),
            api_key: snapshot.api_key.clone(),
            device_id: snapshot.device_id.clone(),
            collection_interval_secs: snapshot.collection_interval_secs,
            log_level: snapshot.log_level.clone(),
            enabled_modules: snapshot.enabled_modules.clone(),
            osquery_path: snapshot.osquery_path.display().to_string(),
            validate_ssl: snapshot.validate_ssl,
            timeout_secs: snapshot.timeout_secs,
        }
    }

    /// Key/value pairs in write order. Empty secrets and ids are omitted so
    /// they do not shadow values from lower layers.
    fn entries(&self) -> Vec<(ConfigKey, Value)> {
        let mut entries = vec![(ConfigKey::ApiUrl, json!(self.api_url))];
        if !self.api_key.is_empty() {
            entries.push((ConfigKey::ApiKey, json!(self.api_key)));
        }
        if !self.device_id.is_empty() {
            entries.push((ConfigKey::DeviceId, json!(self.device_id)));
        }
        entries.extend([
            (
                ConfigKey::CollectionInterval,
                json!(self.collection_interval_secs),
            ),
            (ConfigKey::LogLevel, json!(self.log_level)),
            (ConfigKey::EnabledModules, json!(self.enabled_modules)),
            (ConfigKey::OsqueryPath, json!(self.osquery_path)),
            (ConfigKey::ValidateSsl, json!(self.validate_ssl)),
            (ConfigKey::Timeout, json!(self.timeout_secs)),
        ]);
        entries
    }

    /// Write the key set as an XML property list at `path`.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if self.api_url.is_empty() {
            return Err(Error::InvalidValue {
                key: ConfigKey::ApiUrl.name().to_string(),
                reason: "refusing to persist an empty ApiUrl".to_string(),
            });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let mut dict = plist::Dictionary::new();
        for (key, value) in self.entries() {
            if let Some(pv) = json_to_plist(&value) {
                dict.insert(key.name().to_string(), pv);
            }
        }

        let tmp_path = path.with_extension(format!("plist.tmp.{}", std::process::id()));
        let written = write_xml(&plist::Value::Dictionary(dict), &tmp_path)
            .and_then(|()| {
                fs::rename(&tmp_path, path).map_err(|e| Error::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            });
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        info!(path = %path.display(), "wrote system configuration");
        Ok(())
    }
}

/// Serialize `value` to `path`, keeping I/O failures as `Error::Io` so the
/// caller can still see `PermissionDenied`.
fn write_xml(value: &plist::Value, path: &Path) -> Result<()> {
    let io_error = |source: std::io::Error| Error::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = fs::File::create(path).map_err(io_error)?;
    value.to_writer_xml(&mut file).map_err(|e| match e.into_io() {
        Ok(source) => io_error(source),
        Err(e) => Error::Plist(e),
    })?;
    file.write_all(b"\n").map_err(io_error)?;
    file.sync_all().map_err(io_error)
}
