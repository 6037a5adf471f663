//! Structured logging for the agent.
//!
//! Provides dual-mode logging on stderr:
//! - Human-readable console output for interactive use
//! - JSON lines for launchd/MDM log collection
//!
//! stdout is reserved for the run outcome (summary line or JSON report).
//!
//! # Usage
//!
//! ```ignore
//! use rm_core::logging::{generate_run_id, init_logging, LogConfig, LogContext, Stage, event_names};
//!
//! init_logging(&LogConfig::default());
//! let ctx = LogContext::new(generate_run_id());
//! rm_core::log_event!(ctx, INFO, event_names::RUN_STARTED, Stage::Init, "starting collection");
//! ```

pub mod config;
pub mod events;

pub use config::{LogConfig, LogFormat, LogLevel};
pub use events::{event_names, LogContext, Stage};

use std::io::IsTerminal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Crates whose records pass the default filter.
const LOG_TARGETS: [&str; 4] = ["reportmate", "rm_core", "rm_cache", "rm_common"];

/// Build the default filter directive for a level.
pub fn default_directive(level: LogLevel) -> String {
    LOG_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialize the logging subsystem.
///
/// Call once at startup. `RUST_LOG` replaces the computed filter when set.
/// Returns false if a subscriber was already installed.
pub fn init_logging(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config.level)));

    let result = match config.format {
        LogFormat::Human => {
            let use_ansi = std::io::stderr().is_terminal();
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(use_ansi);

            if config.timestamps {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt_layer)
                    .try_init()
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt_layer.without_time())
                    .try_init()
            }
        }
        LogFormat::Jsonl => {
            let json_layer = fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_writer(std::io::stderr);
            tracing_subscriber::registry()
                .with(filter)
                .with(json_layer)
                .try_init()
        }
    };
    result.is_ok()
}

/// Generate a unique run ID for this invocation.
pub fn generate_run_id() -> String {
    let uuid = uuid::Uuid::new_v4();
    // First 12 hex chars of the simple form
    format!("run-{}", &uuid.simple().to_string()[..12])
}

/// Structured event logging with run context.
///
/// Usage:
/// ```ignore
/// log_event!(ctx, INFO, event_names::CACHE_SKIP, Stage::Cache, "interval not elapsed");
/// log_event!(ctx, WARN, event_names::MODULE_FAILED, Stage::Collect, "module failed",
///     module = "network", error = %err);
/// ```
#[macro_export]
macro_rules! log_event {
    ($ctx:expr, INFO, $event:expr, $stage:expr, $msg:expr $(, $($field:tt)+)?) => {
        tracing::info!(
            event = $event,
            run_id = %$ctx.run_id,
            device_id = %$ctx.device_id,
            stage = %$stage,
            $($($field)+,)?
            "{}", $msg
        )
    };
    ($ctx:expr, DEBUG, $event:expr, $stage:expr, $msg:expr $(, $($field:tt)+)?) => {
        tracing::debug!(
            event = $event,
            run_id = %$ctx.run_id,
            device_id = %$ctx.device_id,
            stage = %$stage,
            $($($field)+,)?
            "{}", $msg
        )
    };
    ($ctx:expr, WARN, $event:expr, $stage:expr, $msg:expr $(, $($field:tt)+)?) => {
        tracing::warn!(
            event = $event,
            run_id = %$ctx.run_id,
            device_id = %$ctx.device_id,
            stage = %$stage,
            $($($field)+,)?
            "{}", $msg
        )
    };
    ($ctx:expr, ERROR, $event:expr, $stage:expr, $msg:expr $(, $($field:tt)+)?) => {
        tracing::error!(
            event = $event,
            run_id = %$ctx.run_id,
            device_id = %$ctx.device_id,
            stage = %$stage,
            $($($field)+,)?
            "{}", $msg
        )
    };
}
