//! Recognized configuration keys and per-key value coercion.
//!
//! Every source (plist file, environment, CLI override) yields raw
//! `serde_json::Value`s. Coercion into the typed snapshot field happens here,
//! once per key, so a malformed value can be rejected without disturbing the
//! value inherited from a lower-precedence source.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Configuration keys recognized in any source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConfigKey {
    ApiUrl,
    DeviceId,
    ApiKey,
    CollectionInterval,
    LogLevel,
    EnabledModules,
    OsqueryPath,
    #[serde(rename = "ValidateSSL")]
    ValidateSsl,
    Timeout,
    OsqueryExtensionEnabled,
    OsqueryExtensionPath,
}

impl ConfigKey {
    /// All keys, in the order they are written and displayed.
    pub const ALL: [ConfigKey; 11] = [
        ConfigKey::ApiUrl,
        ConfigKey::DeviceId,
        ConfigKey::ApiKey,
        ConfigKey::CollectionInterval,
        ConfigKey::LogLevel,
        ConfigKey::EnabledModules,
        ConfigKey::OsqueryPath,
        ConfigKey::ValidateSsl,
        ConfigKey::Timeout,
        ConfigKey::OsqueryExtensionEnabled,
        ConfigKey::OsqueryExtensionPath,
    ];

    /// Name as it appears in preference files.
    pub fn name(self) -> &'static str {
        match self {
            ConfigKey::ApiUrl => "ApiUrl",
            ConfigKey::DeviceId => "DeviceId",
            ConfigKey::ApiKey => "ApiKey",
            ConfigKey::CollectionInterval => "CollectionInterval",
            ConfigKey::LogLevel => "LogLevel",
            ConfigKey::EnabledModules => "EnabledModules",
            ConfigKey::OsqueryPath => "OsqueryPath",
            ConfigKey::ValidateSsl => "ValidateSSL",
            ConfigKey::Timeout => "Timeout",
            ConfigKey::OsqueryExtensionEnabled => "OsqueryExtensionEnabled",
            ConfigKey::OsqueryExtensionPath => "OsqueryExtensionPath",
        }
    }

    /// Look up a key by its preference-file name (case-insensitive).
    pub fn from_name(name: &str) -> Option<ConfigKey> {
        ConfigKey::ALL
            .iter()
            .copied()
            .find(|k| k.name().eq_ignore_ascii_case(name))
    }

    /// Environment variable that feeds this key, if any.
    pub fn env_var(self) -> Option<&'static str> {
        match self {
            ConfigKey::ApiUrl => Some("REPORTMATE_API_URL"),
            ConfigKey::DeviceId => Some("REPORTMATE_DEVICE_ID"),
            ConfigKey::ApiKey => Some("REPORTMATE_API_KEY"),
            ConfigKey::CollectionInterval => Some("REPORTMATE_COLLECTION_INTERVAL"),
            ConfigKey::LogLevel => Some("REPORTMATE_LOG_LEVEL"),
            ConfigKey::OsqueryPath => Some("REPORTMATE_OSQUERY_PATH"),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ConfigKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKey::from_name(s).ok_or_else(|| Error::UnknownKey(s.to_string()))
    }
}

fn invalid(key: ConfigKey, reason: impl Into<String>) -> Error {
    Error::InvalidValue {
        key: key.name().to_string(),
        reason: reason.into(),
    }
}

/// Coerce to a trimmed string. Empty strings are allowed.
pub(crate) fn coerce_string(key: ConfigKey, value: &Value) -> Result<String, Error> {
    match value {
        Value::String(s) => Ok(s.trim().to_string()),
        other => Err(invalid(key, format!("expected string, got {}", other))),
    }
}

/// Coerce to a strictly positive integer. Accepts numbers and decimal strings.
pub(crate) fn coerce_positive_int(key: ConfigKey, value: &Value) -> Result<u64, Error> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match parsed {
        Some(n) if n > 0 => Ok(n),
        _ => Err(invalid(key, format!("expected positive integer, got {}", value))),
    }
}

/// Coerce to a boolean. Accepts bools, 0/1, and the usual string spellings.
pub(crate) fn coerce_bool(key: ConfigKey, value: &Value) -> Result<bool, Error> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(invalid(key, format!("expected 0 or 1, got {}", n))),
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Ok(true),
            "false" | "no" | "0" | "off" => Ok(false),
            _ => Err(invalid(key, format!("expected boolean, got {:?}", s))),
        },
        other => Err(invalid(key, format!("expected boolean, got {}", other))),
    }
}

/// Coerce to an ordered, de-duplicated module list.
///
/// Accepts an array of strings or a comma-separated string. Entries are
/// trimmed and lowercased; the first occurrence of a duplicate wins.
pub(crate) fn coerce_module_list(key: ConfigKey, value: &Value) -> Result<Vec<String>, Error> {
    let raw: Vec<String> = match value {
        Value::String(s) => s.split(',').map(str::to_string).collect(),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => out.push(s.clone()),
                    other => {
                        return Err(invalid(key, format!("expected string entry, got {}", other)))
                    }
                }
            }
            out
        }
        other => return Err(invalid(key, format!("expected list, got {}", other))),
    };

    let modules = normalize_modules(raw);
    if modules.is_empty() {
        return Err(invalid(key, "module list is empty"));
    }
    Ok(modules)
}

/// Trim, lowercase, drop empties, and drop duplicates keeping first occurrence.
pub fn normalize_modules<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for entry in raw {
        let name = entry.as_ref().trim().to_ascii_lowercase();
        if !name.is_empty() && !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

/// Coerce and validate a log level name.
pub(crate) fn coerce_log_level(key: ConfigKey, value: &Value) -> Result<String, Error> {
    let s = coerce_string(key, value)?.to_ascii_lowercase();
    match s.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" | "off" => Ok(s),
        "warning" => Ok("warn".to_string()),
        _ => Err(invalid(key, format!("unknown log level {:?}", s))),
    }
}
