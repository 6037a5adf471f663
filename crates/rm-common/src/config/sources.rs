//! Loading of individual configuration sources into partial key maps.
//!
//! Each source yields only the keys it defines. Missing backing files are
//! empty sources, not errors; unreadable or malformed files are errors the
//! resolver logs and then treats as empty.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{Number, Value};
use tracing::debug;

use super::keys::ConfigKey;
use crate::error::{Error, Result};

/// Keys defined by one source, with their raw values.
pub type PartialConfig = BTreeMap<ConfigKey, Value>;

/// Load a preference plist. A missing file yields an empty map.
pub fn load_plist_source(path: &Path) -> Result<PartialConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "preference file absent");
        return Ok(PartialConfig::new());
    }

    let value = plist::Value::from_file(path).map_err(|e| Error::ConfigSource {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let dict = value.into_dictionary().ok_or_else(|| Error::ConfigSource {
        path: path.to_path_buf(),
        reason: "top-level object is not a dictionary".to_string(),
    })?;

    let mut partial = PartialConfig::new();
    for (name, raw) in dict {
        match ConfigKey::from_name(&name) {
            Some(key) => {
                partial.insert(key, plist_to_json(raw));
            }
            None => debug!(path = %path.display(), key = %name, "ignoring unrecognized key"),
        }
    }
    Ok(partial)
}

/// Collect the keys fed by `REPORTMATE_*` environment variables.
pub fn environment_source<F>(lookup: F) -> PartialConfig
where
    F: Fn(&str) -> Option<String>,
{
    let mut partial = PartialConfig::new();
    for key in ConfigKey::ALL {
        if let Some(var) = key.env_var() {
            if let Some(value) = lookup(var) {
                partial.insert(key, Value::String(value));
            }
        }
    }
    partial
}

/// Convert a plist value into the JSON value model used for coercion.
pub fn plist_to_json(value: plist::Value) -> Value {
    match value {
        plist::Value::Boolean(b) => Value::Bool(b),
        plist::Value::String(s) => Value::String(s),
        plist::Value::Integer(i) => {
            if let Some(u) = i.as_unsigned() {
                Value::Number(Number::from(u))
            } else if let Some(s) = i.as_signed() {
                Value::Number(Number::from(s))
            } else {
                Value::Null
            }
        }
        plist::Value::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        plist::Value::Array(items) => Value::Array(items.into_iter().map(plist_to_json).collect()),
        plist::Value::Dictionary(dict) => Value::Object(
            dict.into_iter()
                .map(|(k, v)| (k, plist_to_json(v)))
                .collect(),
        ),
        plist::Value::Date(d) => Value::String(d.to_xml_format()),
        _ => Value::Null,
    }
}

/// Convert a JSON value into a plist value for writing.
pub fn json_to_plist(value: &Value) -> Option<plist::Value> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(plist::Value::Boolean(*b)),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Some(plist::Value::Integer(u.into()))
            } else if let Some(i) = n.as_i64() {
                Some(plist::Value::Integer(i.into()))
            } else {
                n.as_f64().map(plist::Value::Real)
            }
        }
        Value::String(s) => Some(plist::Value::String(s.clone())),
        Value::Array(items) => Some(plist::Value::Array(
            items.iter().filter_map(json_to_plist).collect(),
        )),
        Value::Object(map) => {
            let mut dict = plist::Dictionary::new();
            for (k, v) in map {
                if let Some(pv) = json_to_plist(v) {
                    dict.insert(k.clone(), pv);
                }
            }
            Some(plist::Value::Dictionary(dict))
        }
    }
}
