//! ReportMate common types, configuration, and errors.
//!
//! This crate provides foundational types shared across the agent crates:
//! - Error taxonomy with stable categories
//! - Configuration keys, sources, and the immutable snapshot
//! - Layered configuration resolution and the system config writer
//! - Collection payload types

pub mod config;
pub mod error;
pub mod payload;

pub use config::{
    ConfigKey, ConfigPaths, ConfigResolver, ConfigSource, ConfigurationSnapshot,
    SystemConfiguration,
};
pub use error::{Error, ErrorCategory, Result};
pub use payload::{CollectionPayload, DeviceMetadata};

/// Reverse-DNS domain used for preference files.
pub const PREFERENCE_DOMAIN: &str = "com.github.reportmate";

/// Client version reported in payload metadata and the User-Agent header.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
