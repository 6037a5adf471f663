//! Shared fakes for rm-core integration tests.
//!
//! - [`FakeRunner`]: a scripted `ProcessRunner` whose query tool answers SQL
//!   through a responder closure, in both the one-shot and the interactive
//!   form, and which never sleeps.
//! - [`FakeTransmitter`]: records payloads and replays queued outcomes.
//! - [`OneShotServer`]: a loopback HTTP server answering one request.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use rm_common::ConfigurationSnapshot;
use rm_core::query::{
    CommandSpec, InteractiveProcess, ProcessOutput, ProcessRunner, RunnerError, SessionTimings,
};
use rm_core::transmit::{TransmissionOutcome, Transmitter};
use serde_json::Value;

/// How the query tool answers one statement.
#[derive(Debug, Clone)]
pub enum Reply {
    Rows(Value),
    Fail(&'static str),
}

pub type Responder = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

/// Behaviour of the interactive session with the extension loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionBehavior {
    /// Probes see the extension registered.
    Ready,
    /// Probes never see the extension.
    NeverReady,
    /// stdout closes after this many completed exchanges (probes included).
    BreakAfter(usize),
}

/// Handshake timings that finish instantly against the fakes.
pub fn fast_timings() -> SessionTimings {
    SessionTimings {
        warmup: Duration::ZERO,
        probes: 2,
        probe_interval: Duration::ZERO,
        probe_timeout: Duration::from_millis(300),
        exit_grace: Duration::ZERO,
    }
}

/// Create an empty file standing in for the query tool.
pub fn fake_tool(dir: &Path) -> PathBuf {
    let tool = dir.join("osqueryi");
    std::fs::write(&tool, b"").unwrap();
    tool
}

pub struct FakeRunner {
    tool: PathBuf,
    responder: Responder,
    extension: ExtensionBehavior,
    commands: Mutex<HashMap<String, ProcessOutput>>,
    /// SQL passed to one-shot tool invocations, in order.
    pub simple_queries: Arc<Mutex<Vec<String>>>,
    /// Lines written to interactive sessions, in order.
    pub session_lines: Arc<Mutex<Vec<String>>>,
    /// Programs other than the tool that were run.
    pub commands_run: Mutex<Vec<String>>,
    pub spawns: AtomicUsize,
    pub sleeps: Mutex<Vec<Duration>>,
}

impl FakeRunner {
    pub fn new(tool: impl Into<PathBuf>, responder: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Self {
        FakeRunner {
            tool: tool.into(),
            responder: Arc::new(responder),
            extension: ExtensionBehavior::Ready,
            commands: Mutex::new(HashMap::new()),
            simple_queries: Arc::new(Mutex::new(Vec::new())),
            session_lines: Arc::new(Mutex::new(Vec::new())),
            commands_run: Mutex::new(Vec::new()),
            spawns: AtomicUsize::new(0),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn with_extension(mut self, behavior: ExtensionBehavior) -> Self {
        self.extension = behavior;
        self
    }

    /// Script the output of a non-tool program.
    pub fn with_command(self, program: &str, stdout: &str) -> Self {
        self.commands.lock().unwrap().insert(
            program.to_string(),
            ProcessOutput {
                stdout: stdout.as_bytes().to_vec(),
                exit_code: Some(0),
                ..ProcessOutput::default()
            },
        );
        self
    }

    pub fn simple_queries(&self) -> Vec<String> {
        self.simple_queries.lock().unwrap().clone()
    }

    pub fn session_lines(&self) -> Vec<String> {
        self.session_lines.lock().unwrap().clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Total tool activity: one-shot queries plus interactive spawns.
    pub fn tool_activity(&self) -> usize {
        self.simple_queries().len() + self.spawn_count()
    }
}

impl ProcessRunner for FakeRunner {
    fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, RunnerError> {
        if spec.program == self.tool {
            let sql = spec.args.last().cloned().unwrap_or_default();
            self.simple_queries.lock().unwrap().push(sql.clone());
            return Ok(match (self.responder)(&sql) {
                Reply::Rows(value) => ProcessOutput {
                    stdout: value.to_string().into_bytes(),
                    exit_code: Some(0),
                    ..ProcessOutput::default()
                },
                Reply::Fail(stderr) => ProcessOutput {
                    stderr: stderr.as_bytes().to_vec(),
                    exit_code: Some(1),
                    ..ProcessOutput::default()
                },
            });
        }

        let program = spec.display_name();
        self.commands_run.lock().unwrap().push(program.clone());
        self.commands
            .lock()
            .unwrap()
            .get(&program)
            .cloned()
            .ok_or(RunnerError::CommandNotFound(program))
    }

    fn spawn_interactive(
        &self,
        spec: &CommandSpec,
    ) -> Result<Box<dyn InteractiveProcess>, RunnerError> {
        assert_eq!(spec.program, self.tool, "interactive session must use the query tool");
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            responder: Arc::clone(&self.responder),
            behavior: self.extension,
            lines: Arc::clone(&self.session_lines),
            pending: Vec::new(),
            last_statement: None,
            exchanges: 0,
            running: true,
            broken: false,
        }))
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

/// Interactive transcript: a prompt, the statement's JSON, then the
/// sentinel's JSON, delivered in small chunks.
struct FakeSession {
    responder: Responder,
    behavior: ExtensionBehavior,
    lines: Arc<Mutex<Vec<String>>>,
    pending: Vec<u8>,
    last_statement: Option<String>,
    exchanges: usize,
    running: bool,
    broken: bool,
}

impl FakeSession {
    fn answer(&self, statement: &str) -> Option<String> {
        if statement.contains("osquery_extensions") {
            return Some(match self.behavior {
                ExtensionBehavior::NeverReady => "[\n\n]".to_string(),
                _ => r#"[{"name":"macadmins_extension"}]"#.to_string(),
            });
        }
        match (self.responder)(statement) {
            Reply::Rows(value) => Some(serde_json::to_string_pretty(&value).unwrap()),
            Reply::Fail(_) => None,
        }
    }
}

impl InteractiveProcess for FakeSession {
    fn write_line(&mut self, line: &str) -> Result<(), RunnerError> {
        if !self.running {
            return Err(RunnerError::Closed);
        }
        self.lines.lock().unwrap().push(line.to_string());
        if line == ".exit" {
            self.running = false;
            return Ok(());
        }
        if let Some(marker) = line
            .strip_prefix("SELECT '")
            .and_then(|rest| rest.split('\'').next())
            .filter(|_| line.contains("reportmate_sentinel"))
        {
            let statement = self.last_statement.take().unwrap_or_default();
            let mut transcript = String::from("osquery> ");
            if let Some(json) = self.answer(&statement) {
                transcript.push_str(&json);
                transcript.push('\n');
            }
            transcript.push_str(&format!(
                "osquery> [\n  {{\"reportmate_sentinel\":\"{}\"}}\n]\n",
                marker
            ));
            self.pending.extend_from_slice(transcript.as_bytes());
            self.exchanges += 1;
            if let ExtensionBehavior::BreakAfter(n) = self.behavior {
                if self.exchanges > n {
                    self.broken = true;
                }
            }
        } else {
            self.last_statement = Some(line.to_string());
        }
        Ok(())
    }

    fn read_chunk(&mut self, _timeout: Duration) -> Result<Vec<u8>, RunnerError> {
        if self.broken {
            return Err(RunnerError::Closed);
        }
        let n = self.pending.len().min(11);
        Ok(self.pending.drain(..n).collect())
    }

    fn is_running(&mut self) -> bool {
        self.running
    }

    fn terminate(&mut self, _grace: Duration) {
        self.running = false;
    }
}

/// Transmitter that records payloads and replays queued outcomes.
#[derive(Clone, Default)]
pub struct FakeTransmitter {
    pub sent: Arc<Mutex<Vec<Value>>>,
    pub health_checks: Arc<AtomicUsize>,
    outcomes: Arc<Mutex<VecDeque<TransmissionOutcome>>>,
}

impl FakeTransmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, outcome: TransmissionOutcome) -> Self {
        self.outcomes.lock().unwrap().push_back(outcome);
        self
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }
}

impl Transmitter for FakeTransmitter {
    fn check_health(&self, _snapshot: &ConfigurationSnapshot) -> bool {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn send(&self, _snapshot: &ConfigurationSnapshot, payload: &Value) -> TransmissionOutcome {
        self.sent.lock().unwrap().push(payload.clone());
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| TransmissionOutcome::success(1, "accepted"))
    }
}

/// A request captured by [`OneShotServer`].
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Loopback HTTP server that answers exactly one request.
pub struct OneShotServer {
    pub base_url: String,
    captured: mpsc::Receiver<CapturedRequest>,
}

impl OneShotServer {
    pub fn start(status: u16, body: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let body = body.to_string();
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());

            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            let mut parts = request_line.split_whitespace();
            let method = parts.next().unwrap_or_default().to_string();
            let path = parts.next().unwrap_or_default().to_string();

            let mut headers = HashMap::new();
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
                }
            }

            let length = headers
                .get("content-length")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            let mut raw = vec![0u8; length];
            reader.read_exact(&mut raw).unwrap();

            let response = format!(
                "HTTP/1.1 {} Status\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            let mut stream = stream;
            stream.write_all(response.as_bytes()).unwrap();
            stream.flush().unwrap();

            let _ = tx.send(CapturedRequest {
                method,
                path,
                headers,
                body: String::from_utf8_lossy(&raw).to_string(),
            });
        });

        OneShotServer {
            base_url: format!("http://127.0.0.1:{}", port),
            captured: rx,
        }
    }

    pub fn request(&self) -> CapturedRequest {
        self.captured
            .recv_timeout(Duration::from_secs(10))
            .expect("server saw no request")
    }
}

/// A loopback URL nothing listens on.
pub fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}", port)
}
