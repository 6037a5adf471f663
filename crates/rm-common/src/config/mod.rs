//! Configuration loading for the ReportMate agent.
//!
//! This module provides:
//! - The recognized key set and per-key coercion
//! - Six-layer key-level resolution (defaults → user file → system file →
//!   managed profile → environment → runtime overrides)
//! - The immutable [`ConfigurationSnapshot`] handed to every collaborator
//! - The write-only system configuration writer
//!
//! The startup banner of older clients described four sources; the six-layer
//! order implemented here is authoritative.

pub mod extension;
pub mod keys;
pub mod resolve;
pub mod snapshot;
pub mod sources;
pub mod system;

pub use extension::ExtensionLocator;
pub use keys::ConfigKey;
pub use resolve::ConfigResolver;
pub use snapshot::ConfigurationSnapshot;
pub use sources::PartialConfig;
pub use system::SystemConfiguration;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::PREFERENCE_DOMAIN;

/// A configuration layer, ordered lowest to highest precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// Built-in defaults.
    Defaults,
    /// Per-user preference file.
    UserFile,
    /// System-wide preference file.
    SystemFile,
    /// MDM-managed profile store.
    ManagedProfile,
    /// `REPORTMATE_*` environment variables.
    Environment,
    /// Explicit runtime overrides (CLI flags, `set_override`).
    RuntimeOverride,
}

impl ConfigSource {
    /// Every layer, lowest precedence first.
    pub const PRECEDENCE: [ConfigSource; 6] = [
        ConfigSource::Defaults,
        ConfigSource::UserFile,
        ConfigSource::SystemFile,
        ConfigSource::ManagedProfile,
        ConfigSource::Environment,
        ConfigSource::RuntimeOverride,
    ];
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Defaults => write!(f, "default"),
            ConfigSource::UserFile => write!(f, "user"),
            ConfigSource::SystemFile => write!(f, "system"),
            ConfigSource::ManagedProfile => write!(f, "managed"),
            ConfigSource::Environment => write!(f, "env"),
            ConfigSource::RuntimeOverride => write!(f, "override"),
        }
    }
}

/// Locations of the file-backed sources.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub user_file: PathBuf,
    pub system_file: PathBuf,
    pub managed_file: PathBuf,
}

impl ConfigPaths {
    /// Paths rooted in a single directory (tests, relocated installs).
    pub fn rooted_at(root: &std::path::Path) -> Self {
        let file = format!("{}.plist", PREFERENCE_DOMAIN);
        ConfigPaths {
            user_file: root.join("user").join(&file),
            system_file: root.join("system").join(&file),
            managed_file: root.join("managed").join(&file),
        }
    }
}

impl Default for ConfigPaths {
    fn default() -> Self {
        let file = format!("{}.plist", PREFERENCE_DOMAIN);
        let user_file = dirs::home_dir()
            .map(|h| h.join("Library/Preferences").join(&file))
            .unwrap_or_else(|| PathBuf::from("~/Library/Preferences").join(&file));
        ConfigPaths {
            user_file,
            system_file: PathBuf::from("/Library/Preferences").join(&file),
            managed_file: PathBuf::from("/Library/Managed Preferences").join(&file),
        }
    }
}
