//! ReportMate agent
//!
//! The entry point for the `reportmate` binary:
//! - `run` (default): collect, cache, and transmit device telemetry
//! - `health`: probe the collection API
//! - `config show` / `config set-system`: inspect and persist configuration
//! - `query`: run one diagnostic osquery statement

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use rm_cache::{default_cache_dir, CacheStore};
use rm_common::config::keys::normalize_modules;
use rm_common::{ConfigKey, ConfigPaths, ConfigResolver, ConfigurationSnapshot, SystemConfiguration};
use rm_core::exit_codes::ExitCode;
use rm_core::logging::{generate_run_id, init_logging, LogConfig, LogContext, LogFormat};
use rm_core::orchestrator::{is_http_url, CollectionOrchestrator, RunOptions};
use rm_core::query::{QueryEngine, SystemProcessRunner};
use rm_core::transmit::{HttpTransmitter, Transmitter};
use rm_core::ModuleRegistry;
use serde_json::json;

/// ReportMate - device telemetry collection agent
#[derive(Parser)]
#[command(name = "reportmate")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Flags for the default `run` command
    #[command(flatten)]
    run: RunArgs,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format for results on stdout
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Human)]
    format: OutputFormat,

    /// Log record format on stderr (human, jsonl)
    #[arg(long, global = true, env = "REPORTMATE_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect, cache, and transmit (default)
    Run(RunArgs),

    /// Check the collection API health endpoint
    Health,

    /// Configuration management
    Config(ConfigArgs),

    /// Run one osquery statement through the query engine
    Query(QueryArgs),
}

#[derive(Args, Debug, Clone, Default)]
struct RunArgs {
    /// Collect even if the collection interval has not elapsed
    #[arg(long)]
    force: bool,

    /// Collect and cache, but do not transmit
    #[arg(long, conflicts_with = "transmit_only")]
    collect_only: bool,

    /// Transmit the last cached payload without collecting
    #[arg(long)]
    transmit_only: bool,

    /// Run a single module by id
    #[arg(long, value_name = "ID", conflicts_with = "modules")]
    run_module: Option<String>,

    /// Run a comma-separated list of modules
    #[arg(long, value_delimiter = ',', value_name = "IDS")]
    modules: Option<Vec<String>>,

    /// Override the device identifier
    #[arg(long)]
    device_id: Option<String>,

    /// Override the collection API base URL
    #[arg(long)]
    api_url: Option<String>,
}

impl RunArgs {
    fn options(&self) -> RunOptions {
        let modules = match (&self.run_module, &self.modules) {
            (Some(one), _) => Some(normalize_modules([one])),
            (None, Some(list)) => Some(normalize_modules(list)),
            (None, None) => None,
        };
        RunOptions {
            force: self.force,
            collect_only: self.collect_only,
            transmit_only: self.transmit_only,
            modules: modules.filter(|m| !m.is_empty()),
        }
    }
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[command(subcommand)]
    action: ConfigCommands,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the resolved configuration and where each value came from
    Show,

    /// Write the system-wide preference file (requires root)
    SetSystem(SetSystemArgs),
}

#[derive(Args, Debug)]
struct SetSystemArgs {
    /// Collection API base URL
    #[arg(long)]
    api_url: String,

    /// Shared secret for the collection API
    #[arg(long)]
    api_key: Option<String>,

    /// Explicit device identifier
    #[arg(long)]
    device_id: Option<String>,

    /// Seconds between scheduled collections
    #[arg(long)]
    collection_interval: Option<u64>,

    /// Comma-separated module ids
    #[arg(long, value_delimiter = ',')]
    enabled_modules: Option<Vec<String>>,

    /// Path to osqueryi
    #[arg(long)]
    osquery_path: Option<String>,

    /// Verify TLS certificates
    #[arg(long)]
    validate_ssl: Option<bool>,

    /// Request and query timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Args, Debug)]
struct QueryArgs {
    /// SQL statement to run
    sql: String,
}

fn main() {
    let code = run_main();
    std::process::exit(code.as_i32());
}

fn run_main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    ExitCode::Clean
                }
                _ => ExitCode::ArgsError,
            };
            let _ = e.print();
            return code;
        }
    };
    let Cli {
        command,
        run,
        global,
    } = cli;

    let resolver = Arc::new(ConfigResolver::new(ConfigPaths::default()));
    let log_config = LogConfig::resolve(
        global.verbose,
        Some(resolver.snapshot().log_level.as_str()),
        global.log_format,
        |key| std::env::var(key).ok(),
    );
    init_logging(&log_config);
    // Resolve again now that a subscriber exists, so warnings about
    // unreadable sources are not lost.
    resolver.reload();

    match command.unwrap_or(Commands::Run(run)) {
        Commands::Run(args) => run_collection(&resolver, &global, &args),
        Commands::Health => run_health(&resolver, &global),
        Commands::Config(ConfigArgs {
            action: ConfigCommands::Show,
        }) => run_config_show(&resolver, &global),
        Commands::Config(ConfigArgs {
            action: ConfigCommands::SetSystem(args),
        }) => run_config_set_system(&resolver, &args),
        Commands::Query(args) => run_query(&resolver, &global, &args),
    }
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("reportmate: cannot encode output: {}", e),
    }
}

/// Cache root: `REPORTMATE_CACHE_DIR` when set, else the platform default.
fn cache_dir() -> PathBuf {
    std::env::var_os("REPORTMATE_CACHE_DIR")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(default_cache_dir)
}

fn run_collection(resolver: &Arc<ConfigResolver>, global: &GlobalOpts, args: &RunArgs) -> ExitCode {
    if let Some(device_id) = &args.device_id {
        resolver.set_override(ConfigKey::DeviceId, json!(device_id));
    }
    if let Some(api_url) = &args.api_url {
        resolver.set_override(ConfigKey::ApiUrl, json!(api_url));
    }

    let ctx = LogContext::new(generate_run_id());
    let mut orchestrator = CollectionOrchestrator::new(
        Arc::clone(resolver),
        CacheStore::new(cache_dir()),
        ModuleRegistry::builtin(),
        Arc::new(SystemProcessRunner::new()),
        Box::new(HttpTransmitter),
        ctx,
    );
    let report = orchestrator.run(&args.options());
    let code = report.exit_code();

    match global.format {
        OutputFormat::Human => println!("{}", report.summary_line()),
        OutputFormat::Json => match serde_json::to_value(&report) {
            Ok(mut value) => {
                if let Some(map) = value.as_object_mut() {
                    map.insert("exit_code".to_string(), json!(code.code_name()));
                }
                print_json(&value);
            }
            Err(e) => {
                eprintln!("reportmate: cannot encode run report: {}", e);
                return ExitCode::InternalError;
            }
        },
    }
    code
}

fn run_health(resolver: &ConfigResolver, global: &GlobalOpts) -> ExitCode {
    let snapshot = resolver.snapshot();
    if !snapshot.has_api_url() || !is_http_url(&snapshot.api_url) {
        eprintln!("reportmate: ApiUrl is not set to an http(s) URL");
        return ExitCode::ConfigError;
    }
    let healthy = HttpTransmitter.check_health(&snapshot);
    match global.format {
        OutputFormat::Human => println!(
            "{}: {}",
            snapshot.api_url,
            if healthy { "healthy" } else { "unreachable" }
        ),
        OutputFormat::Json => print_json(&json!({
            "api_url": snapshot.api_url,
            "healthy": healthy,
        })),
    }
    if healthy {
        ExitCode::Clean
    } else {
        ExitCode::TransmissionFailed
    }
}

fn display_value(snapshot: &ConfigurationSnapshot, key: ConfigKey) -> String {
    match key {
        ConfigKey::ApiUrl => snapshot.api_url.clone(),
        ConfigKey::DeviceId => snapshot.device_id.clone(),
        ConfigKey::ApiKey => snapshot.masked_api_key(),
        ConfigKey::CollectionInterval => snapshot.collection_interval_secs.to_string(),
        ConfigKey::LogLevel => snapshot.log_level.clone(),
        ConfigKey::EnabledModules => snapshot.enabled_modules.join(","),
        ConfigKey::OsqueryPath => snapshot.osquery_path.display().to_string(),
        ConfigKey::ValidateSsl => snapshot.validate_ssl.to_string(),
        ConfigKey::Timeout => snapshot.timeout_secs.to_string(),
        ConfigKey::OsqueryExtensionEnabled => snapshot.extension_enabled.to_string(),
        ConfigKey::OsqueryExtensionPath => snapshot
            .extension_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
    }
}

fn run_config_show(resolver: &ConfigResolver, global: &GlobalOpts) -> ExitCode {
    let snapshot = resolver.snapshot();
    match global.format {
        OutputFormat::Human => {
            for key in ConfigKey::ALL {
                println!(
                    "{:<24} {:<48} ({})",
                    key.name(),
                    display_value(&snapshot, key),
                    snapshot.source_of(key)
                );
            }
        }
        OutputFormat::Json => print_json(&snapshot.to_display_json()),
    }
    ExitCode::Clean
}

fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

fn run_config_set_system(resolver: &ConfigResolver, args: &SetSystemArgs) -> ExitCode {
    if !is_root() {
        eprintln!("reportmate: config set-system requires root privileges (try sudo)");
        return ExitCode::PermissionError;
    }
    if !is_http_url(&args.api_url) {
        eprintln!("reportmate: --api-url must be an http(s) URL");
        return ExitCode::ArgsError;
    }

    let mut config = SystemConfiguration::from_snapshot(&resolver.snapshot());
    config.api_url = args.api_url.trim_end_matches('/').to_string();
    if let Some(key) = &args.api_key {
        config.api_key = key.clone();
    }
    if let Some(id) = &args.device_id {
        config.device_id = id.clone();
    }
    if let Some(interval) = args.collection_interval.filter(|v| *v > 0) {
        config.collection_interval_secs = interval;
    }
    if let Some(modules) = &args.enabled_modules {
        let modules = normalize_modules(modules);
        if !modules.is_empty() {
            config.enabled_modules = modules;
        }
    }
    if let Some(path) = &args.osquery_path {
        config.osquery_path = path.clone();
    }
    if let Some(validate) = args.validate_ssl {
        config.validate_ssl = validate;
    }
    if let Some(timeout) = args.timeout.filter(|v| *v > 0) {
        config.timeout_secs = timeout;
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.to_ascii_lowercase();
    }

    let path = &resolver.paths().system_file;
    match config.write_to(path) {
        Ok(()) => {
            println!("wrote {}", path.display());
            ExitCode::Clean
        }
        Err(e) => {
            eprintln!("reportmate: {}\n  hint: {}", e, e.remediation());
            match e {
                rm_common::Error::PermissionDenied(_) => ExitCode::PermissionError,
                rm_common::Error::Io { ref source, .. }
                    if source.kind() == std::io::ErrorKind::PermissionDenied =>
                {
                    ExitCode::PermissionError
                }
                rm_common::Error::Io { .. } => ExitCode::IoError,
                _ => ExitCode::ConfigError,
            }
        }
    }
}

fn run_query(resolver: &ConfigResolver, global: &GlobalOpts, args: &QueryArgs) -> ExitCode {
    let snapshot = resolver.snapshot();
    let mut engine = QueryEngine::new(&snapshot, Arc::new(SystemProcessRunner::new()));
    if !engine.is_available() {
        eprintln!(
            "reportmate: query tool not found (OsqueryPath = {})",
            snapshot.osquery_path.display()
        );
        return ExitCode::ConfigError;
    }

    let result = engine.execute(&args.sql);
    engine.shutdown();
    match result {
        Ok(rows) => {
            match global.format {
                OutputFormat::Json => print_json(&serde_json::Value::Array(
                    rows.into_iter().map(serde_json::Value::Object).collect(),
                )),
                OutputFormat::Human => {
                    for row in &rows {
                        let line = row
                            .iter()
                            .map(|(k, v)| match v.as_str() {
                                Some(s) => format!("{}={}", k, s),
                                None => format!("{}={}", k, v),
                            })
                            .collect::<Vec<_>>()
                            .join(" ");
                        println!("{}", line);
                    }
                    eprintln!("{} row(s)", rows.len());
                }
            }
            ExitCode::Clean
        }
        Err(e) => {
            eprintln!("reportmate: query failed: {}", e);
            ExitCode::InternalError
        }
    }
}
