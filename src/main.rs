mod config;
mod data;
mod pipeline;
mod scheduler;
mod sink;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::{ConfigError, Settings, INTERVAL_TIME_SEC};
use data::{CoinGeckoClient, BACKFILL_WINDOWS};
use dotenv::dotenv;
use pipeline::{find_ids, Backfill, LiveJob};
use scheduler::{spawn_signal_listener, JobRunner};
use sink::{ensure_database, InfluxSink};
use rolling_file::{BasicRollingFileAppender, RollingConditionBasic};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;

const LOG_FILE_NAME: &str = "crypto_to_influxdb.log";
const LOG_FILE_MAX_BYTES: u64 = 1_000_000;
const LOG_FILE_BACKUPS: usize = 5;

#[derive(Debug, Parser)]
#[command(version, about = "Stores CoinGecko market data in InfluxDB")]
struct Cli {
    /// Configuration file; settings missing from it fall back to environment variables.
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll current prices every minute until interrupted (default).
    Run,
    /// Import the price history of every configured pair once.
    Backfill,
    /// Print the CoinGecko ids of coins with the given ticker symbols.
    FindIds {
        #[arg(required = true)]
        symbols: Vec<String>,
    },
}

/// Opens the size-capped log file in `dir`.
///
/// The active file is rolled to `crypto_to_influxdb.log.1` once it reaches
/// `LOG_FILE_MAX_BYTES`; older files shift up to `.5` and the oldest is dropped.
fn log_file_appender(dir: &Path) -> anyhow::Result<BasicRollingFileAppender> {
    BasicRollingFileAppender::new(
        dir.join(LOG_FILE_NAME),
        RollingConditionBasic::new().max_size(LOG_FILE_MAX_BYTES),
        LOG_FILE_BACKUPS,
    )
    .context("Failed to create log file")
}

/// Sets up stdout and rolling file logging.
///
/// # Arguments
/// * `debug`: Emit `DEBUG` level events when true, `INFO` otherwise
///
/// # Returns
/// The guard flushing the file writer; it must live until exit.
fn init_logging(debug: bool) -> anyhow::Result<WorkerGuard> {
    let appender = log_file_appender(Path::new("."))?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_max_level(if debug { Level::DEBUG } else { Level::INFO })
        .with_ansi(false)
        .with_writer(std::io::stdout.and(file_writer))
        .init();

    Ok(guard)
}

/// Loads and validates settings, then ensures the target database exists.
///
/// # Returns
/// `None` when the settings are unusable; the offending values have been logged.
async fn connect(settings: &Settings) -> anyhow::Result<Option<InfluxSink>> {
    if settings.validate().is_err() {
        settings.log_invalid();
        return Ok(None);
    }
    settings.log_summary();

    let mut sink = InfluxSink::new(&settings.influxdb_host, settings.influxdb_port);
    ensure_database(&mut sink, &settings.influxdb_db_name).await?;
    Ok(Some(sink))
}

/// Polls live prices on a fixed interval until SIGINT or SIGTERM.
async fn run_live(settings: Settings) -> anyhow::Result<ExitCode> {
    let Some(sink) = connect(&settings).await? else {
        return Ok(ExitCode::from(1));
    };

    let provider = CoinGeckoClient::new()?;
    let mut job = LiveJob::new(
        Box::new(provider),
        Box::new(sink),
        settings.pairs(),
        settings.influxdb_db_name.clone(),
    );

    let cancel = CancellationToken::new();
    let listener = spawn_signal_listener(cancel.clone());

    let mut runner = JobRunner::new(Duration::from_secs(INTERVAL_TIME_SEC));
    runner.run(&mut job, cancel).await;
    listener.abort();

    info!(
        "Scheduler {:?} after {} run(s)",
        runner.state(),
        runner.iterations()
    );
    Ok(ExitCode::SUCCESS)
}

/// Imports the decade, 90-day and 1-day history of every configured pair.
async fn run_backfill(settings: Settings) -> anyhow::Result<ExitCode> {
    let Some(sink) = connect(&settings).await? else {
        return Ok(ExitCode::from(1));
    };

    let provider = CoinGeckoClient::new()?;
    let report = Backfill::new(&provider, &sink, &BACKFILL_WINDOWS)
        .run(&settings.pairs())
        .await?;

    info!(
        "Backfill finished: {} pair(s), {} point(s) written, {} point(s) failed",
        report.pairs, report.written, report.failed
    );
    Ok(ExitCode::SUCCESS)
}

async fn run_find_ids(symbols: Vec<String>) -> anyhow::Result<ExitCode> {
    let provider = CoinGeckoClient::new()?;
    let ids = find_ids(&provider, &symbols).await?;

    info!("Found {} id(s) for {} symbol(s)", ids.len(), symbols.len());
    for id in ids {
        println!("{}", id);
    }
    Ok(ExitCode::SUCCESS)
}

/// Entry point.
///
/// 1. Load environment variables from `.env`
/// 2. Parse the command line
/// 3. Resolve settings and start logging at the configured level
/// 4. Dispatch to the live poller, the backfill or the id lookup
///
/// Exits with status 1 when the database settings are unusable or malformed.
#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::FindIds { symbols } => {
            let _guard = init_logging(false)?;
            run_find_ids(symbols).await
        }
        command => {
            let settings = match Settings::load(&cli.config) {
                Ok(settings) => settings,
                Err(e) => match e.downcast_ref::<ConfigError>() {
                    Some(config_error) => {
                        let _guard = init_logging(false)?;
                        config_error.log();
                        return Ok(ExitCode::from(1));
                    }
                    None => return Err(e),
                },
            };
            let _guard = init_logging(settings.debug)?;
            info!("Loaded configuration from [{}]", cli.config.display());
            info!("DEBUG_FLAG: {}", settings.debug);

            match command {
                Command::Backfill => run_backfill(settings).await,
                _ => run_live(settings).await,
            }
        }
    }
}
