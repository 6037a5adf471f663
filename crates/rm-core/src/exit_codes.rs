//! Exit codes for the reportmate CLI.
//!
//! Exit codes communicate the run outcome to launchd, MDM scripts, and
//! wrappers without requiring output parsing.
//!
//! Exit code ranges:
//! - 0-9: Operational outcomes (success, skip, recoverable run failures)
//! - 10-19: User/environment errors (recoverable by user action)
//! - 20-29: Internal errors (bugs, should be reported)

/// Exit codes for reportmate operations.
///
/// These codes are a stable contract for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    // ========================================================================
    // Operational Outcomes (0-9)
    // ========================================================================
    /// Run finished, skipped by the interval gate, or command succeeded
    Clean = 0,

    /// Transmission failed; the payload stays cached for a transmit-only retry
    TransmissionFailed = 1,

    /// Transmit-only requested but nothing is cached
    NoCachedData = 2,

    /// Every requested module failed or was unknown; nothing was cached
    NothingCollected = 3,

    // ========================================================================
    // User / Environment Errors (10-19)
    // ========================================================================
    /// Invalid arguments
    ArgsError = 10,

    /// Fatal configuration error (missing or malformed ApiUrl, bad value)
    ConfigError = 11,

    /// Permission denied (system configuration requires root)
    PermissionError = 12,

    // ========================================================================
    // Internal Errors (20-29)
    // ========================================================================
    /// Internal error (bug - please report)
    InternalError = 20,

    /// I/O error
    IoError = 21,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == ExitCode::Clean
    }

    /// Check if this exit code is a user/environment error (codes 10-19).
    pub fn is_user_error(self) -> bool {
        let code = self as i32;
        (10..20).contains(&code)
    }

    /// Check if this exit code is an internal error (codes 20-29).
    pub fn is_internal_error(self) -> bool {
        (self as i32) >= 20
    }

    /// Get the code name as a string constant (for JSON output).
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK",
            ExitCode::TransmissionFailed => "ERR_TRANSMISSION",
            ExitCode::NoCachedData => "ERR_NO_CACHED_DATA",
            ExitCode::NothingCollected => "ERR_NOTHING_COLLECTED",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::ConfigError => "ERR_CONFIG",
            ExitCode::PermissionError => "ERR_PERMISSION",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}
