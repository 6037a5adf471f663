//! Error types for ReportMate.
//!
//! Every fallible operation in the agent returns a structured error instead
//! of printing. Errors carry:
//! - A stable category matching the pipeline's recovery policy
//! - A stable numeric code for machine parsing
//! - A remediation hint for humans
//!
//! Recovery policy per category:
//!
//! | Category            | Recovery                                         |
//! |---------------------|--------------------------------------------------|
//! | configuration       | skip the offending source, keep prior values     |
//! | query_execution     | empty result for that query, warn                |
//! | extension_handshake | degrade to the simple tier for the engine's life |
//! | cache_io            | collect and transmit without caching             |
//! | transmission        | surfaced as the run outcome; payload stays cached|
//! | fatal_configuration | abort before any collection                      |

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for ReportMate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories, one per recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Unreadable or malformed configuration source.
    Configuration,
    /// Query tool launch failure, non-zero exit, or malformed output.
    QueryExecution,
    /// Extension never became ready within the handshake window.
    ExtensionHandshake,
    /// Cache directory unreadable or unwritable.
    CacheIo,
    /// Network, HTTP status, or body encoding failure.
    Transmission,
    /// Run cannot proceed at all (missing endpoint, missing privilege).
    FatalConfiguration,
}

impl ErrorCategory {
    /// Whether failures in this category are handled locally without
    /// ending the run.
    pub fn recoverable(self) -> bool {
        !matches!(
            self,
            ErrorCategory::Transmission | ErrorCategory::FatalConfiguration
        )
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::QueryExecution => write!(f, "query_execution"),
            ErrorCategory::ExtensionHandshake => write!(f, "extension_handshake"),
            ErrorCategory::CacheIo => write!(f, "cache_io"),
            ErrorCategory::Transmission => write!(f, "transmission"),
            ErrorCategory::FatalConfiguration => write!(f, "fatal_configuration"),
        }
    }
}

/// Unified error type for configuration handling and shared plumbing.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration source {path} unreadable: {reason}")]
    ConfigSource { path: PathBuf, reason: String },

    #[error("unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("fatal configuration error: {0}")]
    FatalConfiguration(String),

    #[error("insufficient privilege: {0}")]
    PermissionDenied(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("property list error: {0}")]
    Plist(#[from] plist::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the stable error code.
    ///
    /// - 10-19: Configuration errors
    /// - 60-69: I/O and serialization errors
    pub fn code(&self) -> u32 {
        match self {
            Error::ConfigSource { .. } => 10,
            Error::UnknownKey(_) => 11,
            Error::InvalidValue { .. } => 12,
            Error::FatalConfiguration(_) => 13,
            Error::PermissionDenied(_) => 14,
            Error::Io { .. } => 60,
            Error::Plist(_) => 61,
            Error::Json(_) => 62,
        }
    }

    /// Returns the recovery category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::ConfigSource { .. }
            | Error::UnknownKey(_)
            | Error::InvalidValue { .. }
            | Error::Plist(_)
            | Error::Json(_) => ErrorCategory::Configuration,
            Error::FatalConfiguration(_) | Error::PermissionDenied(_) => {
                ErrorCategory::FatalConfiguration
            }
            Error::Io { .. } => ErrorCategory::Configuration,
        }
    }

    /// Returns a human-readable remediation hint.
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::ConfigSource { .. } | Error::Plist(_) | Error::Json(_) => {
                "Check the preference file with 'plutil -lint <file>'; the source is skipped until fixed."
            }
            Error::UnknownKey(_) => "Run 'reportmate config show' to list recognized keys.",
            Error::InvalidValue { .. } => {
                "Correct the value; the previously resolved value stays in effect."
            }
            Error::FatalConfiguration(_) => {
                "Set ApiUrl via MDM profile, 'reportmate config set-system', or REPORTMATE_API_URL."
            }
            Error::PermissionDenied(_) => "Re-run with elevated privileges (sudo).",
            Error::Io { .. } => "Check permissions and free space for the target directory.",
        }
    }
}
