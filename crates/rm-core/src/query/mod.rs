//! Query execution against osquery.
//!
//! Two tiers:
//! - **Simple**: one `osqueryi --json "<sql>"` process per query.
//! - **Extension**: a persistent interactive session with the macadmins
//!   extension loaded, used only when an extension path resolved and the
//!   handshake succeeded. Any handshake or channel failure degrades the
//!   engine to the simple tier for the rest of its life.
//!
//! Queries run strictly one at a time; the engine is single-owner state
//! (`&mut self` on every query path).

pub mod demarcate;
pub mod result;
pub mod runner;
pub mod session;

pub use result::{QueryError, QueryResult, Row};
pub use runner::{
    CommandSpec, InteractiveProcess, ProcessOutput, ProcessRunner, RunnerError,
    SystemProcessRunner,
};
pub use session::{ExtensionSession, SessionState, SessionTimings};

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rm_common::ConfigurationSnapshot;
use tracing::{debug, instrument, warn};

use result::rows_from_stdout;
use session::{default_socket_path, shell_mode_args, SessionFailure};

/// Name of the interactive tool looked up on `PATH`.
pub const QUERY_TOOL_NAME: &str = "osqueryi";

/// Location inside the osquery macOS app bundle.
pub const BUNDLED_QUERY_TOOL: &str = "/opt/osquery/lib/osquery.app/Contents/MacOS/osqueryd";

/// Locate the query tool: configured path, then `PATH`, then the app bundle.
pub fn discover_query_tool(configured: &Path, path_var: Option<OsString>) -> Option<PathBuf> {
    if configured.is_file() {
        return Some(configured.to_path_buf());
    }
    if let Some(path_var) = path_var {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(QUERY_TOOL_NAME);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    let bundled = Path::new(BUNDLED_QUERY_TOOL);
    bundled.is_file().then(|| bundled.to_path_buf())
}

/// Whether `name` is a plain table identifier.
pub fn is_valid_table_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Executes queries for module processors.
pub struct QueryEngine {
    runner: Arc<dyn ProcessRunner>,
    tool: Option<PathBuf>,
    timeout: Duration,
    session: Option<ExtensionSession>,
    known_tables: HashSet<String>,
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("tool", &self.tool)
            .field("timeout", &self.timeout)
            .field("session", &self.session)
            .field("known_tables", &self.known_tables.len())
            .finish()
    }
}

impl QueryEngine {
    /// Build an engine from a snapshot, discovering the tool on disk.
    pub fn new(snapshot: &ConfigurationSnapshot, runner: Arc<dyn ProcessRunner>) -> Self {
        let tool = discover_query_tool(&snapshot.osquery_path, std::env::var_os("PATH"));
        match &tool {
            Some(path) => debug!(tool = %path.display(), "query tool found"),
            None => warn!(
                configured = %snapshot.osquery_path.display(),
                "query tool not found; queries will return empty results"
            ),
        }
        Self::with_tool(
            tool,
            snapshot.active_extension().map(Path::to_path_buf),
            snapshot.timeout(),
            runner,
        )
    }

    /// Build an engine with an already-resolved tool and extension.
    pub fn with_tool(
        tool: Option<PathBuf>,
        extension: Option<PathBuf>,
        timeout: Duration,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        let session = match (&tool, extension) {
            (Some(_), Some(ext)) => Some(ExtensionSession::new(ext, default_socket_path())),
            _ => None,
        };
        QueryEngine {
            runner,
            tool,
            timeout,
            session,
            known_tables: HashSet::new(),
        }
    }

    /// Replace the handshake timings (tests, slow machines).
    pub fn with_session_timings(mut self, timings: SessionTimings) -> Self {
        self.session = self.session.take().map(|s| s.with_timings(timings));
        self
    }

    /// Whether the query tool was found.
    pub fn is_available(&self) -> bool {
        self.tool.is_some()
    }

    pub fn tool(&self) -> Option<&Path> {
        self.tool.as_deref()
    }

    /// State of the extension session, None when no extension is configured.
    pub fn session_state(&self) -> Option<SessionState> {
        self.session.as_ref().map(ExtensionSession::state)
    }

    pub fn handshake_attempts(&self) -> u32 {
        self.session
            .as_ref()
            .map_or(0, ExtensionSession::handshake_attempts)
    }

    /// Run one query, preferring the extension session when it is usable.
    #[instrument(skip(self), level = "debug")]
    pub fn execute(&mut self, sql: &str) -> Result<Vec<Row>, QueryError> {
        let tool = self.tool.clone().ok_or(QueryError::ToolUnavailable)?;

        if let Some(session) = self.session.as_mut() {
            if session.ensure_ready(self.runner.as_ref(), &tool) {
                match session.query(sql, self.timeout) {
                    Ok(rows) => return Ok(rows),
                    Err(SessionFailure::Query(e)) => return Err(e),
                    Err(SessionFailure::Broken(reason)) => {
                        warn!(
                            reason = %reason,
                            "extension session failed; degrading to simple tier"
                        );
                        session.degrade(self.runner.as_ref());
                    }
                }
            }
        }

        self.execute_simple(&tool, sql)
    }

    fn execute_simple(&self, tool: &Path, sql: &str) -> Result<Vec<Row>, QueryError> {
        let mut args = shell_mode_args(tool);
        args.push("--json".to_string());
        args.push(sql.to_string());
        let spec = CommandSpec::new(tool)
            .args(args)
            .with_timeout(self.timeout);

        let output = self.runner.run(&spec)?;
        if output.timed_out {
            return Err(QueryError::Timeout(self.timeout));
        }
        if output.exit_code != Some(0) {
            return Err(QueryError::Execution {
                code: output.exit_code,
                stderr: output.stderr_str().trim().to_string(),
            });
        }
        rows_from_stdout(&output.stdout)
    }

    /// Run a keyed set of queries in input order.
    ///
    /// Always returns one result per input. A failed query is logged and
    /// yields an empty result.
    pub fn execute_batch<K, Q>(&mut self, queries: &[(K, Q)]) -> Vec<QueryResult>
    where
        K: AsRef<str>,
        Q: AsRef<str>,
    {
        queries
            .iter()
            .map(|(key, sql)| {
                let key = key.as_ref();
                match self.execute(sql.as_ref()) {
                    Ok(rows) => QueryResult::new(key, rows),
                    Err(e) => {
                        warn!(query = key, error = %e, "query failed; using empty result");
                        QueryResult::empty(key)
                    }
                }
            })
            .collect()
    }

    /// Whether `name` is a queryable table. Positive answers are memoized;
    /// misses are re-checked on every call.
    pub fn is_table_available(&mut self, name: &str) -> bool {
        if !is_valid_table_name(name) {
            debug!(table = name, "rejecting invalid table name");
            return false;
        }
        if self.known_tables.contains(name) {
            return true;
        }
        let sql = format!(
            "SELECT name FROM osquery_registry WHERE registry = 'table' AND name = '{}';",
            name
        );
        match self.execute(&sql) {
            Ok(rows) if !rows.is_empty() => {
                self.known_tables.insert(name.to_string());
                true
            }
            Ok(_) => false,
            Err(e) => {
                debug!(table = name, error = %e, "table availability check failed");
                false
            }
        }
    }

    /// Run a shell-fallback command through the same runner.
    pub fn run_command(&self, program: &str, args: &[&str]) -> Result<ProcessOutput, RunnerError> {
        let spec = CommandSpec::new(program)
            .args(args.iter().copied())
            .with_timeout(self.timeout);
        self.runner.run(&spec)
    }

    /// Tear down the extension session. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.shutdown(self.runner.as_ref());
        }
    }
}

impl Drop for QueryEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
