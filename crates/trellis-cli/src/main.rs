//! Command-line runner for Trellis scripts.
//!
//! # Usage
//!
//! ```bash
//! # Run scripts (globs are expanded)
//! trellis run "flows/*.trl"
//!
//! # Point relative URLs at a local server and fix the random seed
//! trellis run smoke.trl --base-url http://localhost:3000 --seed 7
//!
//! # Give the dry-run driver canned element text
//! trellis run login.trl --text "h1=Dashboard"
//!
//! # Static checks only
//! trellis check "flows/**/*.trl"
//!
//! # Dump the token stream
//! trellis tokens smoke.trl
//!
//! # Turn a session log back into a script
//! trellis convert ~/.trellis/logs/smoke_20240101_120000.jsonl -o replay.trl
//!
//! # Shell completions
//! trellis completions zsh > _trellis
//! ```

mod converter;
mod http_transport;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use trellis_core::config::{logs_dir, TrellisConfig};
use trellis_core::interpreter::{ExecutionReport, Interpreter};
use trellis_core::lexer::tokenize;
use trellis_core::recording_driver::RecordingDriver;
use trellis_core::session::Session;
use trellis_core::TrellisError;

use http_transport::UreqTransport;

/// Run and check Trellis automation scripts.
#[derive(Parser)]
#[command(name = "trellis")]
#[command(about = "Run and check Trellis browser-automation and API-testing scripts")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true, env = "TRELLIS_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run scripts with the dry-run driver
    Run {
        /// Script paths or glob patterns
        #[arg(required = true)]
        scripts: Vec<String>,

        /// Config file (defaults to ~/.trellis/config.json)
        #[arg(short, long, env = "TRELLIS_CONFIG")]
        config: Option<PathBuf>,

        /// Base URL for relative navigation and HTTP calls
        #[arg(long, env = "TRELLIS_BASE_URL")]
        base_url: Option<String>,

        /// Default timeout in milliseconds
        #[arg(short = 'o', long, env = "TRELLIS_TIMEOUT")]
        timeout: Option<u64>,

        /// Seed for the random namespace
        #[arg(long, env = "TRELLIS_SEED")]
        seed: Option<u64>,

        /// Do not write a session log
        #[arg(long)]
        no_session_log: bool,

        /// Canned element text for the dry-run driver, as SELECTOR=TEXT
        #[arg(long = "text", value_parser = parse_selector_text)]
        texts: Vec<(String, String)>,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Tokenize and parse scripts without running them
    Check {
        /// Script paths or glob patterns
        #[arg(required = true)]
        scripts: Vec<String>,
    },

    /// Print the token stream of a script
    Tokens {
        script: PathBuf,
    },

    /// Convert a JSONL session log into a script
    Convert {
        /// Path to the JSONL log file (reads from stdin if omitted)
        log: Option<PathBuf>,

        /// Write the script here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Generate shell completions
    Completions {
        shell: Shell,
    },
}

fn parse_selector_text(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((selector, text)) if !selector.is_empty() => Ok((selector.to_string(), text.to_string())),
        _ => Err(format!("expected SELECTOR=TEXT, got '{}'", raw)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_file.as_deref());

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Scripts(code)) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

fn init_tracing(verbose: u8, log_file: Option<&Path>) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path.file_name().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("trellis.log"));
            let file_appender = tracing_appender::rolling::never(dir, name);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file_appender)
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

#[derive(Debug)]
enum CliError {
    /// Script failures were already reported; carries the exit code of the first.
    Scripts(u8),
    Config(String),
    Io(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Scripts(code) => ExitCode::from(*code),
            CliError::Config(_) => ExitCode::from(3),
            CliError::Io(_) => ExitCode::from(4),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Scripts(code) => write!(f, "script failed with exit code {}", code),
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Io(msg) => write!(f, "IO error: {}", msg),
        }
    }
}

/// Expands each argument as a glob. A pattern matching nothing is kept as a
/// literal path so the failure to read it gets reported.
fn expand_scripts(patterns: &[String]) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for pattern in patterns {
        let matches: Vec<PathBuf> = glob::glob(pattern)
            .into_iter()
            .flatten()
            .filter_map(Result::ok)
            .collect();
        if matches.is_empty() {
            paths.push(PathBuf::from(pattern));
        } else {
            paths.extend(matches);
        }
    }
    paths
}

fn diagnostic(path: &Path, error: &TrellisError) -> String {
    match error.line() {
        Some(line) => format!("{}:{}: [{}] {}", path.display(), line, error.code(), error.message()),
        None => format!("{}: [{}] {}", path.display(), error.code(), error.message()),
    }
}

fn read_script(path: &Path) -> Result<String, TrellisError> {
    Ok(std::fs::read_to_string(path)?)
}

fn load_config(path: Option<&Path>) -> Result<TrellisConfig, CliError> {
    match path {
        Some(path) => TrellisConfig::load_from(path).map_err(|e| CliError::Config(e.to_string())),
        None => Ok(TrellisConfig::load()),
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Run {
            scripts,
            config,
            base_url,
            timeout,
            seed,
            no_session_log,
            texts,
            format,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(url) = base_url {
                config.base_url = Some(url);
            }
            if let Some(ms) = timeout {
                config.default_timeout_ms = ms;
            }
            if seed.is_some() {
                config.random_seed = seed;
            }
            if no_session_log {
                config.session_log = false;
            }
            run_scripts(&expand_scripts(&scripts), &config, &texts, format).await
        }
        Command::Check { scripts } => check_scripts(&expand_scripts(&scripts)),
        Command::Tokens { script } => print_tokens(&script),
        Command::Convert { log, output } => {
            let script = match log {
                Some(path) => converter::LogConverter::convert_file(&path),
                None => converter::LogConverter::convert_stdin(),
            }
            .map_err(|e| CliError::Io(format!("Failed to convert log: {}", e)))?;
            match output {
                Some(path) => {
                    std::fs::write(&path, script)
                        .map_err(|e| CliError::Io(format!("Failed to write {}: {}", path.display(), e)))?;
                    eprintln!("Wrote {}", path.display());
                }
                None => print!("{}", script),
            }
            Ok(())
        }
        Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "trellis", &mut std::io::stdout());
            Ok(())
        }
    }
}

async fn run_scripts(
    paths: &[PathBuf],
    config: &TrellisConfig,
    texts: &[(String, String)],
    format: OutputFormat,
) -> Result<(), CliError> {
    let mut first_failure: Option<u8> = None;
    let mut passed = 0;

    for path in paths {
        let outcome = run_one(path, config, texts).await;
        match format {
            OutputFormat::Text => match &outcome {
                Ok(report) => {
                    for line in &report.logs {
                        println!("{}", line);
                    }
                    eprintln!("{}: ok ({} actions)", path.display(), report.actions.len());
                }
                Err(e) => eprintln!("{}", diagnostic(path, e)),
            },
            OutputFormat::Json => println!("{}", run_summary(path, &outcome)),
        }

        match outcome {
            Ok(_) => passed += 1,
            Err(e) => {
                first_failure.get_or_insert(e.exit_code() as u8);
            }
        }
    }

    if format == OutputFormat::Text && paths.len() > 1 {
        eprintln!("{} of {} scripts passed", passed, paths.len());
    }
    match first_failure {
        Some(code) => Err(CliError::Scripts(code)),
        None => Ok(()),
    }
}

async fn run_one(
    path: &Path,
    config: &TrellisConfig,
    texts: &[(String, String)],
) -> Result<ExecutionReport, TrellisError> {
    let source = read_script(path)?;

    let driver = texts
        .iter()
        .fold(RecordingDriver::new(), |driver, (selector, text)| driver.with_text(selector, text));
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "script".to_string());
    let log_dir = config.session_log.then(logs_dir);
    let session = Session::new(&name, log_dir.as_deref());
    if let Some(log_path) = session.log_path() {
        info!(script = %path.display(), log = %log_path.display(), "session log");
    }

    debug!(script = %path.display(), "running");
    let mut interpreter = Interpreter::new(Arc::new(driver))
        .with_config(config.clone())
        .with_http(Arc::new(UreqTransport::new()))
        .with_session(session)
        .with_script(path);
    let result = interpreter.run_source(&source).await;
    if let Err(e) = &result {
        warn!(script = %path.display(), code = e.code(), "script failed");
    }
    result
}

fn run_summary(path: &Path, outcome: &Result<ExecutionReport, TrellisError>) -> serde_json::Value {
    match outcome {
        Ok(report) => serde_json::json!({
            "script": path.display().to_string(),
            "passed": true,
            "logs": report.logs,
            "actions": report.actions.len(),
        }),
        Err(e) => serde_json::json!({
            "script": path.display().to_string(),
            "passed": false,
            "error": {
                "code": e.code(),
                "line": e.line(),
                "message": e.message(),
            },
        }),
    }
}

fn check_scripts(paths: &[PathBuf]) -> Result<(), CliError> {
    let mut first_failure: Option<u8> = None;
    for path in paths {
        match read_script(path).and_then(|source| trellis_core::parser::parse(&source)) {
            Ok(_) => println!("{}: ok", path.display()),
            Err(e) => {
                println!("{}", diagnostic(path, &e));
                first_failure.get_or_insert(e.exit_code() as u8);
            }
        }
    }
    match first_failure {
        Some(code) => Err(CliError::Scripts(code)),
        None => Ok(()),
    }
}

fn print_tokens(path: &Path) -> Result<(), CliError> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| CliError::Io(format!("cannot read {}: {}", path.display(), e)))?;
    match tokenize(&source) {
        Ok(tokens) => {
            for token in tokens {
                println!("{}:{}\t{:?}\t{:?}", token.line, token.column, token.kind, token.lexeme);
            }
            Ok(())
        }
        Err(e) => {
            let e = TrellisError::from(e);
            eprintln!("{}", diagnostic(path, &e));
            Err(CliError::Scripts(e.exit_code() as u8))
        }
    }
}
