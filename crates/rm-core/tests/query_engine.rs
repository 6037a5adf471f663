//! Query engine behaviour against a scripted query tool.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::{fake_tool, fast_timings, ExtensionBehavior, FakeRunner, Reply};
use rm_core::query::{QueryEngine, QueryError, SessionState};
use serde_json::json;

const TIMEOUT: Duration = Duration::from_secs(2);

fn rows_for(sql: &str) -> Reply {
    if sql.contains("broken_table") {
        Reply::Fail("Error: no such table: broken_table")
    } else if sql.contains("osquery_registry") {
        if sql.contains("'mdm'") {
            Reply::Rows(json!([{ "name": "mdm" }]))
        } else {
            Reply::Rows(json!([]))
        }
    } else {
        Reply::Rows(json!([{ "sql": sql.trim_end_matches(';') }]))
    }
}

fn engine(runner: &Arc<FakeRunner>, tool: PathBuf, extension: Option<&str>) -> QueryEngine {
    QueryEngine::with_tool(
        Some(tool),
        extension.map(PathBuf::from),
        TIMEOUT,
        Arc::clone(runner) as Arc<dyn rm_core::query::ProcessRunner>,
    )
    .with_session_timings(fast_timings())
}

#[test]
fn batch_failure_yields_empty_result_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let tool = fake_tool(dir.path());
    let runner = Arc::new(FakeRunner::new(&tool, rows_for));
    let mut engine = engine(&runner, tool, None);

    let results = engine.execute_batch(&[
        ("first", "SELECT 1"),
        ("second", "SELECT * FROM broken_table"),
        ("third", "SELECT 3"),
    ]);

    assert_eq!(results.len(), 3);
    let keys: Vec<_> = results.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["first", "second", "third"]);
    assert_eq!(results[0].first_str("sql"), Some("SELECT 1"));
    assert!(results[1].is_empty());
    assert_eq!(results[2].first_str("sql"), Some("SELECT 3"));
}

#[test]
fn simple_tier_reports_execution_failure() {
    let dir = tempfile::tempdir().unwrap();
    let tool = fake_tool(dir.path());
    let runner = Arc::new(FakeRunner::new(&tool, rows_for));
    let mut engine = engine(&runner, tool, None);

    match engine.execute("SELECT * FROM broken_table") {
        Err(QueryError::Execution { code, stderr }) => {
            assert_eq!(code, Some(1));
            assert!(stderr.contains("no such table"));
        }
        other => panic!("expected execution failure, got {:?}", other),
    }
}

#[test]
fn missing_tool_yields_empty_results() {
    let runner = Arc::new(FakeRunner::new("/nonexistent/osqueryi", rows_for));
    let mut engine = QueryEngine::with_tool(None, None, TIMEOUT, runner.clone());

    assert!(!engine.is_available());
    assert!(matches!(engine.execute("SELECT 1"), Err(QueryError::ToolUnavailable)));
    let results = engine.execute_batch(&[("a", "SELECT 1"), ("b", "SELECT 2")]);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.is_empty()));
    assert_eq!(runner.tool_activity(), 0);
}

#[test]
fn ready_session_serves_queries_without_one_shot_processes() {
    let dir = tempfile::tempdir().unwrap();
    let tool = fake_tool(dir.path());
    let runner = Arc::new(FakeRunner::new(&tool, rows_for));
    let mut engine = engine(&runner, tool, Some("/opt/reportmate/macadmins_extension.ext"));

    let first = engine.execute("SELECT 1").unwrap();
    let second = engine.execute("SELECT 2;").unwrap();

    assert_eq!(first[0]["sql"], "SELECT 1");
    assert_eq!(second[0]["sql"], "SELECT 2");
    assert_eq!(engine.session_state(), Some(SessionState::Ready));
    assert_eq!(runner.spawn_count(), 1);
    assert!(runner.simple_queries().is_empty());

    engine.shutdown();
    assert_eq!(engine.session_state(), Some(SessionState::Terminated));
    assert_eq!(runner.session_lines().last().map(String::as_str), Some(".exit"));
}

#[test]
fn session_query_error_does_not_desynchronize_stream() {
    let dir = tempfile::tempdir().unwrap();
    let tool = fake_tool(dir.path());
    let runner = Arc::new(FakeRunner::new(&tool, rows_for));
    let mut engine = engine(&runner, tool, Some("/x/macadmins_extension.ext"));

    let results = engine.execute_batch(&[
        ("before", "SELECT 'a'"),
        ("bad", "SELECT * FROM broken_table"),
        ("after", "SELECT 'b'"),
    ]);

    assert_eq!(results[0].first_str("sql"), Some("SELECT 'a'"));
    assert!(results[1].is_empty());
    assert_eq!(results[2].first_str("sql"), Some("SELECT 'b'"));
    assert_eq!(engine.session_state(), Some(SessionState::Ready));
}

#[test]
fn handshake_timeout_degrades_without_second_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let tool = fake_tool(dir.path());
    let runner = Arc::new(
        FakeRunner::new(&tool, rows_for).with_extension(ExtensionBehavior::NeverReady),
    );
    let mut engine = engine(&runner, tool, Some("/x/macadmins_extension.ext"));

    for n in 0..3 {
        let rows = engine.execute(&format!("SELECT {}", n)).unwrap();
        assert_eq!(rows.len(), 1);
    }

    assert_eq!(engine.session_state(), Some(SessionState::Degraded));
    assert_eq!(engine.handshake_attempts(), 1);
    assert_eq!(runner.spawn_count(), 1);
    assert_eq!(runner.simple_queries(), vec!["SELECT 0", "SELECT 1", "SELECT 2"]);
}

#[test]
fn broken_session_degrades_and_retries_on_simple_tier() {
    let dir = tempfile::tempdir().unwrap();
    let tool = fake_tool(dir.path());
    // The handshake probe is exchange 1; the first real query breaks.
    let runner = Arc::new(
        FakeRunner::new(&tool, rows_for).with_extension(ExtensionBehavior::BreakAfter(1)),
    );
    let mut engine = engine(&runner, tool, Some("/x/macadmins_extension.ext"));

    let rows = engine.execute("SELECT 7").unwrap();
    assert_eq!(rows[0]["sql"], "SELECT 7");
    assert_eq!(engine.session_state(), Some(SessionState::Degraded));

    engine.execute("SELECT 8").unwrap();
    assert_eq!(runner.spawn_count(), 1);
    assert_eq!(runner.simple_queries(), vec!["SELECT 7", "SELECT 8"]);
}

#[test]
fn table_availability_is_memoized_only_when_present() {
    let dir = tempfile::tempdir().unwrap();
    let tool = fake_tool(dir.path());
    let runner = Arc::new(FakeRunner::new(&tool, rows_for));
    let mut engine = engine(&runner, tool, None);

    assert!(engine.is_table_available("mdm"));
    assert!(engine.is_table_available("mdm"));
    assert!(!engine.is_table_available("munki_info"));
    assert!(!engine.is_table_available("munki_info"));
    assert!(!engine.is_table_available("mdm; DROP TABLE x"));

    let registry_queries: Vec<_> = runner
        .simple_queries()
        .into_iter()
        .filter(|q| q.contains("osquery_registry"))
        .collect();
    assert_eq!(registry_queries.len(), 3);
    assert_eq!(
        registry_queries
            .iter()
            .filter(|q| q.contains("'munki_info'"))
            .count(),
        2
    );
}

#[test]
fn fallback_command_runs_through_same_runner() {
    let dir = tempfile::tempdir().unwrap();
    let tool = fake_tool(dir.path());
    let runner = Arc::new(FakeRunner::new(&tool, rows_for).with_command("sw_vers", "ProductVersion: 15.1\n"));
    let engine = engine(&runner, tool, None);

    let output = engine.run_command("sw_vers", &[]).unwrap();
    assert!(output.success());
    assert_eq!(output.stdout_str().trim(), "ProductVersion: 15.1");
    assert!(engine.run_command("not-installed", &[]).is_err());
}
