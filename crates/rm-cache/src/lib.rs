//! ReportMate collection cache.
//!
//! Persists the last collection timestamp and the collected payloads so that
//! scheduled runs can skip when the interval has not elapsed and a later
//! transmit-only run can resend what a failed run collected.
//!
//! Layout under one fixed root:
//!
//! ```text
//! <cache_dir>/
//!   last_collection.timestamp   plain-text epoch seconds
//!   collected_data.json         full payload
//!   <module_id>_cache.json      one per module
//! ```
//!
//! Every write goes to a temporary sibling and is renamed into place, so a
//! concurrent reader never observes a half-written file.

pub mod retention;
pub mod store;
pub mod writer;

pub use retention::{PruneReport, DEFAULT_RETENTION};
pub use store::{default_cache_dir, CacheError, CacheStore};
