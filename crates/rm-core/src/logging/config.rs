//! Logging configuration.
//!
//! Supports configuration via:
//! - Environment variables (REPORTMATE_LOG, RUST_LOG, REPORTMATE_LOG_FORMAT)
//! - The `LogLevel` configuration key
//! - CLI flags (-v count, --format)

use serde::{Deserialize, Serialize};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable console format (default).
    #[default]
    Human,
    /// Machine-parseable JSON lines.
    Jsonl,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" | "console" | "pretty" => Ok(LogFormat::Human),
            "jsonl" | "json" | "structured" => Ok(LogFormat::Jsonl),
            _ => Err(format!("unknown log format: {}", s)),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Human => write!(f, "human"),
            LogFormat::Jsonl => write!(f, "jsonl"),
        }
    }
}

/// Log level filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose.
    Trace,
    /// Debug information.
    Debug,
    /// Standard operational info (default).
    #[default]
    Info,
    /// Warnings only.
    Warn,
    /// Errors only.
    Error,
    /// Completely silent.
    Off,
}

impl LogLevel {
    /// Map the CLI verbosity count (0..=3) to a level. Higher counts clamp
    /// to trace.
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => LogLevel::Warn,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "off" | "none" | "quiet" => Ok(LogLevel::Off),
            _ => Err(format!("unknown log level: {}", s)),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
            LogLevel::Off => write!(f, "off"),
        }
    }
}

impl From<LogLevel> for tracing_subscriber::filter::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
            LogLevel::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
            LogLevel::Info => tracing_subscriber::filter::LevelFilter::INFO,
            LogLevel::Warn => tracing_subscriber::filter::LevelFilter::WARN,
            LogLevel::Error => tracing_subscriber::filter::LevelFilter::ERROR,
            LogLevel::Off => tracing_subscriber::filter::LevelFilter::OFF,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Output format.
    pub format: LogFormat,
    /// Minimum log level.
    pub level: LogLevel,
    /// Whether to include timestamps in human output.
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            format: LogFormat::Human,
            level: LogLevel::Warn,
            timestamps: true,
        }
    }
}

impl LogConfig {
    /// Build from the CLI verbosity, the configured `LogLevel` key, and an
    /// environment lookup.
    ///
    /// Precedence, lowest first: the configured level, a non-zero verbosity
    /// count, then `REPORTMATE_LOG`. An unparseable configured level is
    /// ignored. `REPORTMATE_LOG_FORMAT` selects the format unless the CLI
    /// already did.
    pub fn resolve<F>(
        verbosity: u8,
        configured_level: Option<&str>,
        cli_format: Option<LogFormat>,
        env: F,
    ) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = LogConfig::default();

        if let Some(level) = configured_level.and_then(|s| s.parse::<LogLevel>().ok()) {
            config.level = level;
        }
        if verbosity > 0 {
            config.level = LogLevel::from_verbosity(verbosity);
        }
        if let Some(level) = env("REPORTMATE_LOG").and_then(|v| v.parse::<LogLevel>().ok()) {
            config.level = level;
        }

        config.format = match cli_format {
            Some(format) => format,
            None => env("REPORTMATE_LOG_FORMAT")
                .and_then(|v| v.parse::<LogFormat>().ok())
                .unwrap_or_default(),
        };

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_verbosity_mapping() {
        assert_eq!(LogLevel::from_verbosity(0), LogLevel::Warn);
        assert_eq!(LogLevel::from_verbosity(1), LogLevel::Info);
        assert_eq!(LogLevel::from_verbosity(2), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbosity(3), LogLevel::Trace);
        assert_eq!(LogLevel::from_verbosity(9), LogLevel::Trace);
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(" Debug ".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("quiet".parse::<LogLevel>().unwrap(), LogLevel::Off);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_resolve_precedence() {
        let config = LogConfig::resolve(0, Some("debug"), None, env_of(&[]));
        assert_eq!(config.level, LogLevel::Debug);

        let config = LogConfig::resolve(1, Some("debug"), None, env_of(&[]));
        assert_eq!(config.level, LogLevel::Info);

        let config = LogConfig::resolve(
            3,
            Some("debug"),
            None,
            env_of(&[("REPORTMATE_LOG", "error")]),
        );
        assert_eq!(config.level, LogLevel::Error);

        let config = LogConfig::resolve(0, Some("chatty"), None, env_of(&[]));
        assert_eq!(config.level, LogLevel::Warn);
    }

    #[test]
    fn test_resolve_format() {
        let env = env_of(&[("REPORTMATE_LOG_FORMAT", "json")]);
        assert_eq!(
            LogConfig::resolve(0, None, None, &env).format,
            LogFormat::Jsonl
        );
        assert_eq!(
            LogConfig::resolve(0, None, Some(LogFormat::Human), &env).format,
            LogFormat::Human
        );
    }
}
