//! Persistent interactive session for the extension tier.
//!
//! The extension needs several seconds after load before its tables are
//! queryable. One interactive query-tool process is started per engine,
//! the warm-up delay is paid once, and every later query goes through the
//! same stdin/stdout pair.
//!
//! Each query is followed by a sentinel `SELECT` carrying a unique marker.
//! The array before the sentinel's array is the query's result; a sentinel
//! with nothing before it means the query printed no JSON (an SQL error on
//! the tool's stderr). This keeps one failed query from desynchronizing
//! the stream.
//!
//! State machine:
//!
//! ```text
//! Unstarted -> Starting -> AwaitingHandshake -> Ready
//!                  |               |              |
//!                  +-------------> Degraded <-----+   (sticky)
//! any -> Terminated (shutdown)
//! ```

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rm_common::ErrorCategory;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::demarcate::next_array;
use super::result::{rows_from_value, QueryError, Row};
use super::runner::{CommandSpec, InteractiveProcess, ProcessRunner, RunnerError};

/// Column name of the sentinel query.
const SENTINEL_COLUMN: &str = "reportmate_sentinel";

/// Lists extensions registered with the running tool.
const PROBE_SQL: &str = "SELECT name FROM osquery_extensions WHERE type = 'extension';";

/// Graceful exit command of the interactive shell.
const EXIT_COMMAND: &str = ".exit";

/// Upper bound for one blocking read while waiting for output.
const READ_SLICE: Duration = Duration::from_millis(250);

/// Lifecycle state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unstarted,
    Starting,
    AwaitingHandshake,
    Ready,
    Degraded,
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Unstarted => "unstarted",
            SessionState::Starting => "starting",
            SessionState::AwaitingHandshake => "awaiting_handshake",
            SessionState::Ready => "ready",
            SessionState::Degraded => "degraded",
            SessionState::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

/// Fixed timings of the handshake. Independent of the configured query
/// timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    /// Wait after spawn before the first probe.
    pub warmup: Duration,
    /// Probes sent before giving up on the extension.
    pub probes: u32,
    /// Wait between probes that found no extension.
    pub probe_interval: Duration,
    /// Bound on each probe's response.
    pub probe_timeout: Duration,
    /// Wait for the process to exit after `.exit` before signalling.
    pub exit_grace: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        SessionTimings {
            warmup: Duration::from_secs(3),
            probes: 10,
            probe_interval: Duration::from_millis(500),
            probe_timeout: Duration::from_secs(5),
            exit_grace: Duration::from_secs(1),
        }
    }
}

/// Why the extension tier could not be established.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("failed to start interactive query tool: {0}")]
    Spawn(#[from] RunnerError),

    #[error("extension not registered after {attempts} probes")]
    NotReady { attempts: u32 },

    #[error("session I/O failed during handshake: {0}")]
    Io(String),
}

impl HandshakeError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::ExtensionHandshake
    }
}

/// Failure of a query sent through the session.
#[derive(Debug)]
pub enum SessionFailure {
    /// The query itself failed; the session is still usable.
    Query(QueryError),
    /// The channel is broken; the session must be degraded.
    Broken(String),
}

/// The single extension session owned by one query engine.
pub struct ExtensionSession {
    extension: PathBuf,
    socket_path: PathBuf,
    timings: SessionTimings,
    state: SessionState,
    process: Option<Box<dyn InteractiveProcess>>,
    buffer: Vec<u8>,
    next_marker: u64,
    handshake_attempts: u32,
}

impl std::fmt::Debug for ExtensionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionSession")
            .field("extension", &self.extension)
            .field("socket_path", &self.socket_path)
            .field("state", &self.state)
            .field("handshake_attempts", &self.handshake_attempts)
            .finish()
    }
}

/// Per-process socket path for the extension manager.
pub fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("reportmate-{}.em", std::process::id()))
}

impl ExtensionSession {
    pub fn new(extension: impl Into<PathBuf>, socket_path: impl Into<PathBuf>) -> Self {
        ExtensionSession {
            extension: extension.into(),
            socket_path: socket_path.into(),
            timings: SessionTimings::default(),
            state: SessionState::Unstarted,
            process: None,
            buffer: Vec::new(),
            next_marker: 0,
            handshake_attempts: 0,
        }
    }

    pub fn with_timings(mut self, timings: SessionTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn extension(&self) -> &Path {
        &self.extension
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// How many times a handshake has been started. Never exceeds one.
    pub fn handshake_attempts(&self) -> u32 {
        self.handshake_attempts
    }

    /// Arguments for the interactive tool with the extension loaded.
    fn launch_args(&self, tool: &Path) -> Vec<String> {
        let mut args = shell_mode_args(tool);
        args.extend([
            "--json".to_string(),
            "--allow_unsafe".to_string(),
            format!("--extensions_socket={}", self.socket_path.display()),
            format!("--extension={}", self.extension.display()),
        ]);
        args
    }

    /// Start the session on first use. Returns true when queries may be
    /// sent through it.
    pub fn ensure_ready(&mut self, runner: &dyn ProcessRunner, tool: &Path) -> bool {
        match self.state {
            SessionState::Ready => true,
            SessionState::Unstarted => match self.start(runner, tool) {
                Ok(()) => {
                    self.state = SessionState::Ready;
                    info!(extension = %self.extension.display(), "extension session ready");
                    true
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        category = %e.category(),
                        "extension tier unavailable; using simple tier"
                    );
                    self.degrade(runner);
                    false
                }
            },
            _ => false,
        }
    }

    fn start(&mut self, runner: &dyn ProcessRunner, tool: &Path) -> Result<(), HandshakeError> {
        self.state = SessionState::Starting;
        self.handshake_attempts += 1;

        let spec = CommandSpec::new(tool).args(self.launch_args(tool));
        let process = runner.spawn_interactive(&spec)?;
        self.process = Some(process);
        self.state = SessionState::AwaitingHandshake;

        debug!(warmup_ms = self.timings.warmup.as_millis() as u64, "waiting for extension warm-up");
        runner.sleep(self.timings.warmup);

        for attempt in 1..=self.timings.probes {
            match self.exchange(PROBE_SQL, self.timings.probe_timeout) {
                Ok(Some(Value::Array(items))) if !items.is_empty() => {
                    debug!(attempt, extensions = items.len(), "extension registered");
                    return Ok(());
                }
                Ok(_) => {
                    debug!(attempt, "extension not registered yet");
                    runner.sleep(self.timings.probe_interval);
                }
                Err(reason) => return Err(HandshakeError::Io(reason)),
            }
        }
        Err(HandshakeError::NotReady {
            attempts: self.timings.probes,
        })
    }

    /// Send one query through the established session.
    pub fn query(&mut self, sql: &str, timeout: Duration) -> Result<Vec<Row>, SessionFailure> {
        if self.state != SessionState::Ready {
            return Err(SessionFailure::Broken(format!("session is {}", self.state)));
        }
        match self.exchange(sql, timeout) {
            Ok(Some(value)) => rows_from_value(value).map_err(SessionFailure::Query),
            Ok(None) => Err(SessionFailure::Query(QueryError::Execution {
                code: None,
                stderr: "query produced no output in persistent session".to_string(),
            })),
            Err(reason) => Err(SessionFailure::Broken(reason)),
        }
    }

    /// Write `sql` and a sentinel, then collect arrays until the sentinel
    /// comes back. `Ok(None)` means the query produced no array.
    fn exchange(&mut self, sql: &str, timeout: Duration) -> Result<Option<Value>, String> {
        self.next_marker += 1;
        let marker = format!("rm-{}-{}", std::process::id(), self.next_marker);
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| "no session process".to_string())?;

        process
            .write_line(&terminated(sql))
            .map_err(|e| format!("write failed: {}", e))?;
        process
            .write_line(&format!("SELECT '{}' AS {};", marker, SENTINEL_COLUMN))
            .map_err(|e| format!("write failed: {}", e))?;

        let deadline = Instant::now() + timeout;
        let mut arrays: Vec<Value> = Vec::new();
        loop {
            while let Some(range) = next_array(&self.buffer) {
                let parsed = serde_json::from_slice::<Value>(&self.buffer[range.clone()]);
                self.buffer.drain(..range.end);
                let value = parsed.map_err(|e| format!("unparseable session output: {}", e))?;
                if is_sentinel(&value, &marker) {
                    return Ok(arrays.pop());
                }
                arrays.push(value);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(format!("no response within {:?}", timeout));
            }
            let wait = (deadline - now).min(READ_SLICE);
            match process.read_chunk(wait) {
                Ok(bytes) => self.buffer.extend_from_slice(&bytes),
                Err(e) => return Err(format!("read failed: {}", e)),
            }
        }
    }

    /// Mark the session permanently unusable and stop its process.
    pub fn degrade(&mut self, runner: &dyn ProcessRunner) {
        if self.state == SessionState::Terminated {
            return;
        }
        self.stop_process(runner);
        self.state = SessionState::Degraded;
    }

    /// Graceful exit, forced termination if needed, socket cleanup.
    pub fn shutdown(&mut self, runner: &dyn ProcessRunner) {
        if self.state == SessionState::Terminated {
            return;
        }
        self.stop_process(runner);
        self.state = SessionState::Terminated;
    }

    fn stop_process(&mut self, runner: &dyn ProcessRunner) {
        if let Some(mut process) = self.process.take() {
            if process.write_line(EXIT_COMMAND).is_ok() {
                runner.sleep(self.timings.exit_grace);
            }
            if process.is_running() {
                debug!("interactive query tool still running after exit; terminating");
                process.terminate(self.timings.exit_grace);
            }
        }
        self.buffer.clear();
        remove_socket(&self.socket_path);
    }
}

/// `-S` makes `osqueryd` behave as the interactive shell.
pub fn shell_mode_args(tool: &Path) -> Vec<String> {
    if tool.file_name().is_some_and(|n| n == "osqueryd") {
        vec!["-S".to_string()]
    } else {
        Vec::new()
    }
}

fn terminated(sql: &str) -> String {
    let trimmed = sql.trim();
    if trimmed.ends_with(';') {
        trimmed.to_string()
    } else {
        format!("{};", trimmed)
    }
}

fn is_sentinel(value: &Value, marker: &str) -> bool {
    match value.as_array().map(Vec::as_slice) {
        Some([row]) => row.get(SENTINEL_COLUMN).and_then(Value::as_str) == Some(marker),
        _ => false,
    }
}

fn remove_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed extension socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove extension socket"),
    }
}
