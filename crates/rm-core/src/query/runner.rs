//! External process execution for the query tool and shell fallbacks.
//!
//! [`ProcessRunner`] is the only way the agent touches OS processes, so the
//! query engine and module processors can be driven by scripted fakes in
//! tests. [`SystemProcessRunner`] is the real implementation:
//!
//! - Per-command timeout with SIGTERM → SIGKILL escalation
//! - Output size caps to prevent memory exhaustion
//! - Non-blocking pipe reads so a grandchild holding a pipe cannot hang us
//! - Minimal environment (`PATH`, `LC_ALL=C`)
//! - Rejection of command names carrying shell metacharacters
//! - On Linux, children receive SIGTERM if the agent dies first

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// Default timeout per command in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default maximum output size in bytes (16MB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 8192;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Errors that can occur while running a process.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("command failed to spawn: {0}")]
    SpawnFailed(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("process closed its output stream")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Override max output (None = runner default).
    pub max_output: Option<usize>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        CommandSpec {
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_output: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_output(mut self, max_output: usize) -> Self {
        self.max_output = Some(max_output);
        self
    }

    /// The program name as it appears in logs.
    pub fn display_name(&self) -> String {
        self.program.display().to_string()
    }
}

/// Output of a completed (or timed-out) process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code, None if killed by a signal.
    pub exit_code: Option<i32>,
    pub truncated: bool,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ProcessOutput {
    /// Get stdout as string (lossy UTF-8 conversion).
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Get stderr as string (lossy UTF-8 conversion).
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// Exit code 0 and not timed out.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }
}

/// A long-lived child with line-oriented stdin and chunked stdout.
pub trait InteractiveProcess: Send {
    /// Write `line` plus a newline and flush.
    fn write_line(&mut self, line: &str) -> Result<(), RunnerError>;

    /// Read whatever stdout has available, waiting at most `timeout`.
    ///
    /// Returns an empty vector when nothing arrived in time and
    /// [`RunnerError::Closed`] once stdout reached end of file.
    fn read_chunk(&mut self, timeout: Duration) -> Result<Vec<u8>, RunnerError>;

    fn is_running(&mut self) -> bool;

    /// Ask the process to stop, then force it after `grace`.
    fn terminate(&mut self, grace: Duration);
}

/// Capability to run external processes.
pub trait ProcessRunner: Send + Sync {
    /// Spawn, read stdout/stderr to completion, and wait, bounded by the
    /// command's timeout.
    fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, RunnerError>;

    /// Spawn a child with piped stdin/stdout for an interactive session.
    /// The command's timeout is not applied; the caller bounds each read.
    fn spawn_interactive(&self, spec: &CommandSpec)
        -> Result<Box<dyn InteractiveProcess>, RunnerError>;

    /// Block the calling thread. Fakes return immediately.
    fn sleep(&self, duration: Duration);
}

/// Runner backed by real OS processes.
#[derive(Debug, Clone)]
pub struct SystemProcessRunner {
    max_output_bytes: usize,
    kill_grace: Duration,
}

impl Default for SystemProcessRunner {
    fn default() -> Self {
        SystemProcessRunner {
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

impl SystemProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_output(mut self, max_bytes: usize) -> Self {
        self.max_output_bytes = max_bytes;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Validate that a command is safe to execute.
    fn validate_command(program: &Path) -> Result<(), RunnerError> {
        let name = program.to_string_lossy();
        if name.is_empty() {
            return Err(RunnerError::InvalidCommand("empty command".to_string()));
        }

        // Reject commands with shell metacharacters
        if name.contains(['|', '&', ';', '$', '`', '\n', '\r']) {
            return Err(RunnerError::InvalidCommand(format!(
                "command contains shell metacharacters: {}",
                name
            )));
        }

        if program.is_absolute() && !program.exists() {
            return Err(RunnerError::CommandNotFound(name.into_owned()));
        }

        Ok(())
    }

    fn build_command(spec: &CommandSpec) -> Command {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);

        // Clear environment variables that could affect behavior
        command.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            command.env("PATH", path);
        }
        command.env("LC_ALL", "C");
        command.env("LANG", "C");

        #[cfg(target_os = "linux")]
        {
            use std::os::unix::process::CommandExt;
            // SAFETY: prctl is async-signal-safe and touches no parent state.
            unsafe {
                command.pre_exec(|| {
                    if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        command
    }

    fn spawn(command: &mut Command, spec: &CommandSpec) -> Result<Child, RunnerError> {
        command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RunnerError::CommandNotFound(spec.display_name())
            } else {
                error!(command = %spec.display_name(), error = %e, "failed to spawn");
                RunnerError::SpawnFailed(e.to_string())
            }
        })
    }

    /// Execute a child process with timeout and output capture.
    fn execute_with_timeout(
        &self,
        child: &mut Child,
        timeout: Duration,
        max_output: usize,
    ) -> Result<ProcessOutput, RunnerError> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut output = ProcessOutput::default();

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            if Instant::now() >= deadline {
                output.timed_out = true;
                warn!("command timed out, sending SIGTERM");
                kill_with_grace(child, self.kill_grace);
                break;
            }

            let mut did_read = false;
            if let Some(out) = stdout.as_mut() {
                if let Ok(Some(n)) = try_read_nonblocking(out, &mut chunk) {
                    if n > 0 {
                        did_read = true;
                        append_capped(&mut output.stdout, &chunk[..n], max_output, &mut output.truncated);
                    }
                }
            }
            if let Some(err) = stderr.as_mut() {
                if let Ok(Some(n)) = try_read_nonblocking(err, &mut chunk) {
                    if n > 0 {
                        did_read = true;
                        append_capped(&mut output.stderr, &chunk[..n], max_output, &mut output.truncated);
                    }
                }
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    // Process exited, drain remaining output
                    if let Some(out) = stdout.as_mut() {
                        drain_to_limit(out, &mut output.stdout, max_output, &mut output.truncated);
                    }
                    if let Some(err) = stderr.as_mut() {
                        drain_to_limit(err, &mut output.stderr, max_output, &mut output.truncated);
                    }
                    output.exit_code = status.code();
                    output.duration = start.elapsed();
                    trace!(exit_code = ?output.exit_code, "process exited");
                    return Ok(output);
                }
                Ok(None) => {
                    if !did_read {
                        thread::sleep(POLL_INTERVAL);
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to wait for child");
                    return Err(RunnerError::Io(e));
                }
            }
        }

        // Timed out - reap whatever is left
        output.exit_code = child.wait().ok().and_then(|s| s.code());
        output.duration = start.elapsed();
        Ok(output)
    }
}

impl ProcessRunner for SystemProcessRunner {
    fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, RunnerError> {
        Self::validate_command(&spec.program)?;
        let max_output = spec.max_output.unwrap_or(self.max_output_bytes);

        debug!(
            command = %spec.display_name(),
            args = ?spec.args,
            timeout_ms = spec.timeout.as_millis() as u64,
            "running command"
        );

        let mut command = Self::build_command(spec);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = Self::spawn(&mut command, spec)?;

        let output = self.execute_with_timeout(&mut child, spec.timeout, max_output)?;
        debug!(
            command = %spec.display_name(),
            duration_ms = output.duration.as_millis() as u64,
            exit_code = ?output.exit_code,
            timed_out = output.timed_out,
            "command complete"
        );
        Ok(output)
    }

    fn spawn_interactive(
        &self,
        spec: &CommandSpec,
    ) -> Result<Box<dyn InteractiveProcess>, RunnerError> {
        Self::validate_command(&spec.program)?;
        debug!(command = %spec.display_name(), args = ?spec.args, "spawning interactive process");

        let mut command = Self::build_command(spec);
        // stderr is discarded so an unread pipe can never stall the child.
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = Self::spawn(&mut command, spec)?;

        let stdin = child.stdin.take();
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                kill_with_grace(&mut child, Duration::ZERO);
                return Err(RunnerError::SpawnFailed("stdout not captured".to_string()));
            }
        };

        Ok(Box::new(SystemInteractiveProcess {
            child,
            stdin,
            stdout,
            kill_grace: self.kill_grace,
        }))
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Interactive child owned by [`SystemProcessRunner`].
struct SystemInteractiveProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    kill_grace: Duration,
}

impl InteractiveProcess for SystemInteractiveProcess {
    fn write_line(&mut self, line: &str) -> Result<(), RunnerError> {
        let stdin = self.stdin.as_mut().ok_or(RunnerError::Closed)?;
        stdin.write_all(line.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()?;
        Ok(())
    }

    fn read_chunk(&mut self, timeout: Duration) -> Result<Vec<u8>, RunnerError> {
        let deadline = Instant::now() + timeout;
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match try_read_nonblocking(&mut self.stdout, &mut chunk)? {
                Some(0) => return Err(RunnerError::Closed),
                Some(n) => return Ok(chunk[..n].to_vec()),
                None => {}
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self, grace: Duration) {
        // Closing stdin lets a shell exit on EOF before any signal.
        self.stdin.take();
        if self.is_running() {
            kill_with_grace(&mut self.child, grace);
        } else {
            let _ = self.child.wait();
        }
    }
}

impl Drop for SystemInteractiveProcess {
    fn drop(&mut self) {
        if self.is_running() {
            warn!(pid = self.child.id(), "interactive process still running at drop; killing");
            self.stdin.take();
            kill_with_grace(&mut self.child, self.kill_grace);
        }
    }
}

fn append_capped(buf: &mut Vec<u8>, data: &[u8], max: usize, truncated: &mut bool) {
    let space = max.saturating_sub(buf.len());
    if space > 0 {
        let to_copy = data.len().min(space);
        buf.extend_from_slice(&data[..to_copy]);
        if data.len() > space {
            *truncated = true;
        }
    } else if !data.is_empty() {
        *truncated = true;
    }
}

/// Drain what is immediately available from a stream up to the limit.
///
/// Uses non-blocking reads to avoid hanging on grandchild processes
/// that may still hold the pipe open after the direct child exits.
fn drain_to_limit<R: Read + AsRawFdCompat>(
    stream: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
    truncated: &mut bool,
) {
    let mut chunk = vec![0u8; READ_CHUNK];
    while !*truncated {
        match try_read_nonblocking(stream, &mut chunk) {
            Ok(Some(n)) if n > 0 => append_capped(buf, &chunk[..n], max, truncated),
            _ => break,
        }
    }
}

/// Kill a process with SIGTERM, then SIGKILL after the grace period.
#[cfg(unix)]
fn kill_with_grace(child: &mut Child, grace: Duration) {
    let pid = child.id() as i32;

    // SAFETY: signalling our own child by pid.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    debug!(pid, "sent SIGTERM");

    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => {
                trace!(pid, "process exited after SIGTERM");
                return;
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(POLL_INTERVAL),
            Ok(None) => break,
            Err(e) => {
                error!(pid, error = %e, "failed to check process status");
                return;
            }
        }
    }

    warn!(pid, "process did not exit after SIGTERM, sending SIGKILL");
    // SAFETY: as above.
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
    let _ = child.wait();
}

#[cfg(not(unix))]
fn kill_with_grace(child: &mut Child, _grace: Duration) {
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
use std::os::unix::io::AsRawFd as AsRawFdCompat;

#[cfg(not(unix))]
trait AsRawFdCompat {}
#[cfg(not(unix))]
impl<T> AsRawFdCompat for T {}

/// Try to read from a stream without blocking.
///
/// Sets O_NONBLOCK for the duration of one read and restores the original
/// flags. Returns `Ok(None)` if no data is available, `Ok(Some(0))` at end
/// of file.
#[cfg(unix)]
fn try_read_nonblocking<R: Read + AsRawFdCompat>(
    stream: &mut R,
    buf: &mut [u8],
) -> std::io::Result<Option<usize>> {
    let fd = stream.as_raw_fd();

    // SAFETY: fcntl on a descriptor we own for the lifetime of `stream`.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let was_nonblocking = (flags & libc::O_NONBLOCK) != 0;
    if !was_nonblocking {
        let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if result < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }

    let result = stream.read(buf);

    if !was_nonblocking {
        unsafe {
            libc::fcntl(fd, libc::F_SETFL, flags);
        }
    }

    match result {
        Ok(n) => Ok(Some(n)),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(None),
        Err(e) => Err(e),
    }
}

/// Blocking fallback for non-Unix platforms.
#[cfg(not(unix))]
fn try_read_nonblocking<R: Read>(stream: &mut R, buf: &mut [u8]) -> std::io::Result<Option<usize>> {
    stream.read(buf).map(Some)
}
