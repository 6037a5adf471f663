//! ReportMate agent core library.
//!
//! This crate contains the collection pipeline:
//! - Query execution against osquery (simple and extension tiers)
//! - Built-in module processors and device identity
//! - Tolerant transmission to the collection API
//! - The orchestrator tying configuration, cache, collection and transmit
//!   together
//! - Structured logging and stable exit codes

pub mod collect;
pub mod exit_codes;
pub mod logging;
pub mod orchestrator;
pub mod query;
pub mod transmit;

pub use collect::{ModuleError, ModuleProcessor, ModuleRegistry};
pub use orchestrator::{CollectionOrchestrator, Phase, RunError, RunOptions, RunReport};
pub use query::{QueryEngine, QueryError, QueryResult};
pub use transmit::{HttpTransmitter, TransmissionClient, TransmissionError, TransmissionOutcome, Transmitter};
