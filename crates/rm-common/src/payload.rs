//! Collection payload types.
//!
//! Module results are arbitrary JSON-shaped values and are carried as
//! `serde_json::Value` end to end. The payload is one object keyed by module
//! id plus a `metadata` block identifying the device and the run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key of the metadata block inside a payload.
pub const METADATA_KEY: &str = "metadata";

/// Whether a run collected every configured module or a caller-chosen subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionType {
    Full,
    Partial,
}

/// Device identity and run metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetadata {
    pub device_id: String,
    pub serial_number: String,
    pub collected_at: DateTime<Utc>,
    pub client_version: String,
    pub platform: String,
    pub collection_type: CollectionType,
    pub enabled_modules: Vec<String>,
    pub run_id: String,
}

/// The aggregated payload sent to the collection API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionPayload {
    pub metadata: DeviceMetadata,
    #[serde(flatten)]
    pub modules: BTreeMap<String, Value>,
}

impl CollectionPayload {
    pub fn new(metadata: DeviceMetadata) -> Self {
        CollectionPayload {
            metadata,
            modules: BTreeMap::new(),
        }
    }

    /// Add one module's result. The reserved metadata key is refused.
    pub fn insert_module(&mut self, module_id: &str, data: Value) -> bool {
        if module_id == METADATA_KEY {
            return false;
        }
        self.modules.insert(module_id.to_string(), data);
        true
    }

    pub fn module_ids(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}
