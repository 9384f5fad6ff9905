//! cloud-migrate CLI - runs or validates a configured table migration.

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::{Parser, ValueEnum};
use cloud_migrate::{Config, JsonLinesSink, MigrateError, Orchestrator};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "cloud-migrate")]
#[command(about = "Migrate configured tables from SQL Server to a cloud PostgreSQL target")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Logging level
    #[arg(long, value_enum, default_value = "INFO")]
    log_level: LogLevel,

    /// Only validate source against target; write nothing
    #[arg(long)]
    validate_only: bool,

    /// Only process these tables
    #[arg(long, num_args = 1..)]
    tables: Vec<String>,

    /// Directory for the run log file
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Console log format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Print the run report as JSON to stdout
    #[arg(long)]
    output_json: bool,

    /// Append one JSON record per table to this file
    #[arg(long)]
    report_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    #[value(name = "DEBUG")]
    Debug,
    #[value(name = "INFO")]
    Info,
    #[value(name = "WARNING")]
    Warning,
    #[value(name = "ERROR")]
    Error,
    #[value(name = "CRITICAL")]
    Critical,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            eprintln!("{}", e.format_detailed());
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every selected table passed.
async fn run() -> Result<bool, MigrateError> {
    let cli = Cli::parse();

    let log_file = setup_logging(cli.log_level, cli.log_format, &cli.log_dir)?;
    info!("Logging to {}", log_file.display());

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    let mut orchestrator = Orchestrator::new(config)?;
    if let Some(path) = &cli.report_file {
        orchestrator = orchestrator.with_sink(Arc::new(JsonLinesSink::create(path)?));
    }

    let selected: HashSet<String> = cli.tables.iter().cloned().collect();
    let orchestrator = orchestrator.filter(&selected);
    if orchestrator.data_sources().is_empty() {
        warn!("No configured table matches the selection");
    }

    if !orchestrator.connect_source().await {
        error!("Cannot connect to the source database, aborting");
        orchestrator.close().await;
        return Ok(false);
    }

    let passed = if cli.validate_only {
        info!("Validate-only mode: {} tables", orchestrator.data_sources().len());
        let report = orchestrator.validate_all().await;
        for table in &report.tables {
            if table.validation_passed {
                info!("{}: PASSED ({})", table.table, table.diagnostic);
            } else {
                error!("{}: FAILED ({})", table.table, table.diagnostic);
            }
        }
        if cli.output_json {
            println!("{}", report.to_json()?);
        }
        report.all_passed()
    } else {
        let cancel = setup_signal_handler();
        let report = orchestrator.run_migration(&cancel).await;
        let failed = report.failed_tables();
        if failed.is_empty() {
            info!("All {} tables migrated and validated", report.tables.len());
        } else {
            error!("Tables not migrated cleanly: {}", failed.join(", "));
        }
        if cli.output_json {
            println!("{}", report.to_json()?);
        }
        report.succeeded()
    };

    orchestrator.close().await;
    Ok(passed)
}

/// Console plus file logging. Returns the log file path.
fn setup_logging(level: LogLevel, format: LogFormat, dir: &Path) -> Result<PathBuf, MigrateError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!(
        "migration_{}.log",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    ));
    let file = File::create(&path)?;

    let console = match format {
        LogFormat::Json => fmt::layer().json().boxed(),
        LogFormat::Text => fmt::layer().with_target(false).boxed(),
    };
    let file_layer = fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false);

    tracing_subscriber::registry()
        .with(EnvFilter::new(level.directive()))
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| MigrateError::Config(format!("logging setup failed: {}", e)))?;

    Ok(path)
}

/// Cancel the returned token on SIGINT or SIGTERM.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            match signal(kind) {
                Ok(mut stream) => {
                    stream.recv().await;
                    warn!("Received {}, stopping after the current batch", name);
                    token.cancel();
                }
                Err(e) => warn!("Cannot install {} handler: {}", name, e),
            }
        });
    }

    cancel_token
}

/// Cancel the returned token on Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl-C, stopping after the current batch");
            token.cancel();
        }
    });

    cancel_token
}
