//! Transmission of collection payloads to the ReportMate API.
//!
//! The client never retries. A failed send leaves the payload in the cache
//! for a later `--transmit-only` run.

pub mod client;
pub mod response;

pub use client::TransmissionClient;
pub use response::interpret_response;

use rm_common::{ConfigurationSnapshot, ErrorCategory};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Path of the event ingestion endpoint, relative to `ApiUrl`.
pub const EVENTS_PATH: &str = "/api/events";

/// Path of the health endpoint, relative to `ApiUrl`.
pub const HEALTH_PATH: &str = "/health";

/// Both headers carry the same secret; the Windows client sends the second.
pub const PASSPHRASE_HEADERS: [&str; 2] = ["X-API-PASSPHRASE", "X-Client-Passphrase"];

/// Why a transmission failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransmissionError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("server rejected payload (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("transport error: {detail}")]
    Transport { detail: String },

    #[error("encoding error: {detail}")]
    Encoding { detail: String },
}

impl TransmissionError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Transmission
    }
}

/// Result of one send. Always a value, never an error past the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransmissionOutcome {
    Success {
        records_processed: u64,
        message: String,
    },
    Failure {
        error: TransmissionError,
    },
}

impl TransmissionOutcome {
    pub fn success(records_processed: u64, message: impl Into<String>) -> Self {
        TransmissionOutcome::Success {
            records_processed,
            message: message.into(),
        }
    }

    pub fn failure(error: TransmissionError) -> Self {
        TransmissionOutcome::Failure { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TransmissionOutcome::Success { .. })
    }

    pub fn error(&self) -> Option<&TransmissionError> {
        match self {
            TransmissionOutcome::Failure { error } => Some(error),
            TransmissionOutcome::Success { .. } => None,
        }
    }
}

/// Capability to deliver a payload. The orchestrator depends on this, not
/// on HTTP.
pub trait Transmitter {
    fn check_health(&self, snapshot: &ConfigurationSnapshot) -> bool;
    fn send(&self, snapshot: &ConfigurationSnapshot, payload: &Value) -> TransmissionOutcome;
}

/// [`Transmitter`] that builds a [`TransmissionClient`] per call from the
/// snapshot in effect.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpTransmitter;

impl Transmitter for HttpTransmitter {
    fn check_health(&self, snapshot: &ConfigurationSnapshot) -> bool {
        match TransmissionClient::new(snapshot) {
            Ok(client) => client.check_health(),
            Err(e) => {
                tracing::warn!(error = %e, "cannot build HTTP client");
                false
            }
        }
    }

    fn send(&self, snapshot: &ConfigurationSnapshot, payload: &Value) -> TransmissionOutcome {
        match TransmissionClient::new(snapshot) {
            Ok(client) => client.send(payload),
            Err(e) => TransmissionOutcome::failure(e),
        }
    }
}

/// Records counted for a payload: module entries, metadata excluded.
pub fn count_records(payload: &Value) -> u64 {
    payload
        .as_object()
        .map(|obj| {
            obj.keys()
                .filter(|k| k.as_str() != rm_common::payload::METADATA_KEY)
                .count() as u64
        })
        .unwrap_or(0)
}
