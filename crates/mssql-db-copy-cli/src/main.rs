//! mssql-db-copy CLI - Copy a SQL Server database to another instance.

use chrono::Local;
use clap::Parser;
use mssql_db_copy::{
    Config, ConnectionConfig, CopyError, CopyMode, MigrationOrchestrator, MigrationResult,
    ProgressHook, ProgressSnapshot, RunLog,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser)]
#[command(name = "mssql-db-copy")]
#[command(about = "Copy a SQL Server database's schema and data to another instance")]
#[command(version)]
struct Cli {
    /// Source database connection string
    #[arg(value_name = "SOURCE")]
    source: String,

    /// Target database connection string
    #[arg(value_name = "TARGET")]
    target: String,

    /// Create objects on the target without copying data (also --SchemaOnly)
    #[arg(long, aliases = ["SchemaOnly", "schemaonly"], conflicts_with = "data_only")]
    schema_only: bool,

    /// Copy data into the existing, empty target schema (also --DataOnly)
    #[arg(long, aliases = ["DataOnly", "dataonly"])]
    data_only: bool,

    /// Do not write a run log file (also --NoLog)
    #[arg(long, aliases = ["NoLog", "nolog"])]
    no_log: bool,

    /// Path to YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of parallel workers (default: auto-tuned from CPU cores)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        // One per failed item, capped at the fatal error code.
        Ok(failed) => ExitCode::from(u8::try_from(failed).unwrap_or(u8::MAX)),
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<usize, CopyError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(CopyError::Config)?;

    let config = build_config(&cli)?;
    config.validate()?;

    let run_log = if cli.no_log {
        RunLog::disabled()
    } else {
        RunLog::create(&config.migration.log_dir, Local::now())?
    };

    let orchestrator = MigrationOrchestrator::connect(config)
        .await?
        .with_run_log(run_log)
        .with_progress_hook(progress_hook(cli.progress_json));

    let result = orchestrator.run().await?;

    if cli.output_json {
        println!("{}", result.to_json()?);
    } else {
        print_summary(&result);
    }

    Ok(result.items_failed)
}

fn build_config(cli: &Cli) -> Result<Config, CopyError> {
    let mut config = match &cli.config {
        Some(path) => {
            let config = Config::load(path)?;
            info!("Loaded configuration from {:?}", path);
            config
        }
        None => Config::default(),
    };

    // Apply overrides
    config.source = ConnectionConfig::new(cli.source.as_str());
    config.target = ConnectionConfig::new(cli.target.as_str());
    if cli.schema_only {
        config.migration.mode = CopyMode::SchemaOnly;
    } else if cli.data_only {
        config.migration.mode = CopyMode::DataOnly;
    }
    if let Some(w) = cli.workers {
        config.migration.workers = Some(w);
    }

    Ok(config.with_auto_tuning())
}

fn progress_hook(json: bool) -> ProgressHook {
    if json {
        Arc::new(|snapshot: &ProgressSnapshot| {
            if let Ok(line) = serde_json::to_string(snapshot) {
                eprintln!("{}", line);
            }
        })
    } else {
        Arc::new(|snapshot: &ProgressSnapshot| eprintln!("{}", snapshot))
    }
}

fn print_summary(result: &MigrationResult) {
    let status_msg = if result.is_success() {
        "Copy completed!"
    } else {
        "Copy finished with errors."
    };
    println!("\n{}", status_msg);
    println!("  Run ID: {}", result.run_id);
    println!("  Mode: {}", result.mode);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!(
        "  Objects: {}/{}",
        result.items_completed, result.items_total
    );
    println!("  Rows: {}", result.rows_copied);
    if !result.relationships_restored {
        println!("  Foreign keys: not restored");
    }
    if result.error_budget_exhausted {
        println!("  Error budget exhausted");
    }

    if !result.failed_items.is_empty() {
        println!("\n{} failed:", result.items_failed);
        for item in &result.failed_items {
            println!("  {}: {}", item.name, item.error);
        }
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("Unknown verbosity: {}", other)),
    };

    // Keep stdout for the result; progress and logs share stderr.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("Unknown log format: {}", other)),
    }

    Ok(())
}
