//! CLI command definitions for rjq.
//!
//! The manager itself (`start`), the producer side (`submit`, `status`), a
//! statistics viewer (`stats`) and the hidden worker child (`worker`).

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::Parser;
use tracing::{info, warn};

use crate::config::{ManagerConfig, DEFAULT_CONFIG_PATH, DEFAULT_STATS_PATH};
use crate::orchestrator::{Orchestrator, Stats};
use crate::queue::{unix_now, Producer};
use crate::shutdown::{install_signal_handlers, Shutdown};
use crate::store::StoreConfig;
use crate::worker::run_worker_main;

/// Redis-backed job queue manager.
#[derive(Parser, Debug)]
#[command(name = "rjq")]
#[command(about = "Dispatch queued jobs to a pool of supervised worker processes")]
#[command(version)]
#[command(
    long_about = "rjq pulls jobs from per-type queues in a Redis compatible store and runs them in long-lived worker processes.\n\nExample usage:\n  rjq --config rjq.conf start\n  rjq submit mail '\"john@example.com\"' 2\n  rjq status 3f2a9c..."
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Path of the manager configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true, env = "RJQ_CONFIG")]
    pub config: PathBuf,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Run the job manager in the foreground.
    Start,

    /// Submit a job and print its id.
    Submit(SubmitArgs),

    /// Print the state of a job (undef, new, progress, done, error).
    Status(StatusArgs),

    /// Print the statistics of the running manager.
    Stats,

    /// Worker child process, spawned by the manager.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Store selection shared by the producer commands.
#[derive(Parser, Debug)]
pub struct StoreArgs {
    /// Store address, overrides the configuration file.
    #[arg(long, env = "RJQ_DSN")]
    pub dsn: Option<String>,

    /// Database index, used with --dsn.
    #[arg(long, default_value = "0")]
    pub db: u32,
}

/// Arguments for `rjq submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Job type (queue name).
    pub job_type: String,

    /// Job arguments; each one is parsed as JSON, or taken as a string.
    pub args: Vec<String>,

    #[command(flatten)]
    pub store: StoreArgs,
}

/// Arguments for `rjq status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Job id printed by `rjq submit`.
    pub job_id: String,

    #[command(flatten)]
    pub store: StoreArgs,
}

/// Arguments for `rjq worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Job type served by this worker.
    #[arg(long)]
    pub job_type: String,

    /// Handler to run for each job.
    #[arg(long)]
    pub handler: String,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Start => run_start_command(&cli.config).await,
        Commands::Submit(args) => run_submit_command(&cli.config, args).await,
        Commands::Status(args) => run_status_command(&cli.config, args).await,
        Commands::Stats => run_stats_command(&cli.config),
        Commands::Worker(args) => std::process::exit(run_worker_main(&args.job_type, &args.handler)),
    }
}

/// Default log level of a command when neither `RUST_LOG` nor `--log-level`
/// says otherwise.
pub fn default_log_level(cli: &Cli) -> &str {
    match cli.command {
        Commands::Worker(_) => "warn",
        _ => cli.log_level.as_str(),
    }
}

/// Opens the log file named by the manager configuration, if any.
///
/// Only `start` logs to a file; a configuration that cannot be read is
/// reported later by the command itself.
pub fn open_log_file(cli: &Cli) -> anyhow::Result<Option<File>> {
    if !matches!(cli.command, Commands::Start) {
        return Ok(None);
    }
    let Some(path) = ManagerConfig::load(&cli.config).ok().and_then(|c| c.log) else {
        return Ok(None);
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Unable to open log file {}", path.display()))?;
    Ok(Some(file))
}

async fn run_start_command(config_path: &Path) -> anyhow::Result<()> {
    let config = ManagerConfig::load(config_path)?;
    if config.queues.is_empty() {
        warn!(config = %config_path.display(), "No queue configured, nothing will be dispatched");
    }
    info!(
        config = %config_path.display(),
        dsn = %config.server.dsn,
        strategy = ?config.strategy,
        "Loading job manager"
    );

    let shutdown = Shutdown::new();
    let signals = install_signal_handlers(shutdown.clone()).context("Unable to install signal handlers")?;
    let mut orchestrator = Orchestrator::from_config(&config, shutdown)?;
    orchestrator.start().await;
    signals.abort();
    Ok(())
}

fn store_config(config_path: &Path, args: &StoreArgs) -> anyhow::Result<StoreConfig> {
    match &args.dsn {
        Some(dsn) => Ok(StoreConfig::new(dsn.clone()).with_db(args.db)),
        None => Ok(ManagerConfig::load(config_path)?.server),
    }
}

/// Parses a command line job argument: JSON when it parses, a string otherwise.
pub fn parse_job_arg(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

async fn run_submit_command(config_path: &Path, args: SubmitArgs) -> anyhow::Result<()> {
    let mut producer = Producer::new(store_config(config_path, &args.store)?);
    let job_args = args.args.iter().map(|a| parse_job_arg(a)).collect();
    let id = producer
        .submit(&args.job_type, job_args)
        .await
        .with_context(|| format!("Unable to submit a '{}' job", args.job_type))?;
    println!("{}", id);
    Ok(())
}

async fn run_status_command(config_path: &Path, args: StatusArgs) -> anyhow::Result<()> {
    let mut producer = Producer::new(store_config(config_path, &args.store)?);
    let state = producer.query_status(&args.job_id).await?;
    println!("{}", state);
    Ok(())
}

fn run_stats_command(config_path: &Path) -> anyhow::Result<()> {
    let stats_path = match ManagerConfig::load(config_path) {
        Ok(config) => config.stats.unwrap_or_else(|| PathBuf::from(DEFAULT_STATS_PATH)),
        Err(e) => {
            warn!(error = %e, "Using the default statistics path");
            PathBuf::from(DEFAULT_STATS_PATH)
        }
    };
    let stats = Stats::load(&stats_path)
        .with_context(|| format!("No statistics in {} (is the manager running?)", stats_path.display()))?;
    print!("{}", stats.report(unix_now()));
    Ok(())
}
