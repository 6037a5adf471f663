//! Module processors: the per-domain collectors driven by the orchestrator.
//!
//! A processor takes the configuration snapshot and the query engine and
//! returns one JSON value for its module id. Processors never talk to the
//! network or the cache; a failing processor is excluded from the payload
//! without affecting the others.

pub mod catalog;
pub mod identity;

pub use catalog::{CatalogModule, CatalogQuery, FallbackCommand};
pub use identity::{device_id_for_serial, platform, resolve_identity, DeviceIdentity};

use rm_common::ConfigurationSnapshot;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::query::{QueryEngine, QueryError};

/// Why a module produced no result.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module {module} collected no data")]
    NoData { module: String },

    #[error("query failed: {0}")]
    Query(#[from] QueryError),

    #[error("module {module} failed: {reason}")]
    Failed { module: String, reason: String },
}

/// One named domain of device data.
pub trait ModuleProcessor: Send {
    /// Module id, also the payload key.
    fn id(&self) -> &str;

    fn collect(
        &self,
        snapshot: &ConfigurationSnapshot,
        engine: &mut QueryEngine,
    ) -> Result<Value, ModuleError>;
}

/// Processors selected for a run, plus requested ids nothing answers to.
pub struct Selection<'a> {
    pub modules: Vec<&'a dyn ModuleProcessor>,
    pub unknown: Vec<String>,
}

/// Ordered lookup of processors by id.
#[derive(Default)]
pub struct ModuleRegistry {
    processors: Vec<Box<dyn ModuleProcessor>>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the catalog-driven processors for every default
    /// module id.
    pub fn builtin() -> Self {
        let mut registry = ModuleRegistry::new();
        for module in catalog::builtin_modules() {
            registry.register(Box::new(module));
        }
        registry
    }

    /// Add a processor, replacing any existing one with the same id.
    pub fn register(&mut self, processor: Box<dyn ModuleProcessor>) {
        if let Some(slot) = self
            .processors
            .iter_mut()
            .find(|p| p.id() == processor.id())
        {
            debug!(module = processor.id(), "replacing module processor");
            *slot = processor;
        } else {
            self.processors.push(processor);
        }
    }

    pub fn get(&self, id: &str) -> Option<&dyn ModuleProcessor> {
        self.processors
            .iter()
            .find(|p| p.id() == id)
            .map(|p| p.as_ref())
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.processors.iter().map(|p| p.id())
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Resolve `ids` in the given order. Duplicates are dropped.
    pub fn select<S: AsRef<str>>(&self, ids: &[S]) -> Selection<'_> {
        let mut selection = Selection {
            modules: Vec::new(),
            unknown: Vec::new(),
        };
        let mut seen: Vec<&str> = Vec::new();
        for id in ids {
            let id = id.as_ref();
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            match self.get(id) {
                Some(processor) => selection.modules.push(processor),
                None => selection.unknown.push(id.to_string()),
            }
        }
        selection
    }
}
