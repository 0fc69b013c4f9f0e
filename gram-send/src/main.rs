//! gram-send - Background daemon for scheduled posting
//!
//! Runs the scheduler tick at a fixed interval: due posts are started,
//! posts whose containers were still processing are followed up.

use clap::Parser;
use libgramcast::logging::LoggingConfig;
use libgramcast::service::GramcastService;
use libgramcast::{Config, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{error, info, warn};

/// Temp files are swept once per day of uptime
const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Parser, Debug)]
#[command(name = "gram-send")]
#[command(version)]
#[command(about = "Background daemon for scheduled Instagram posts")]
#[command(long_about = "\
gram-send - Background daemon for scheduled Instagram posts

DESCRIPTION:
    gram-send polls the Gramcast database at regular intervals. Each poll
    starts every scheduled post that is due and follows up on posts whose
    Instagram containers were still processing at the previous poll.

    Published posts are removed from the queue. Failed posts stay in the
    queue with their error (see `gram-queue list`) and are not retried.

    The access token is refreshed when it is within a week of expiring, and
    cropped images older than a day are deleted from the temp directory.

USAGE:
    # Run in foreground (logs to stderr)
    gram-send

    # Poll every two minutes (job_ttl_secs must exceed it)
    gram-send --poll-interval 120

    # One pass, e.g. from cron
    gram-send --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the current pass)

CONFIGURATION:
    Configuration file: ~/.config/gramcast/config.toml

    [scheduling]
    poll_interval_secs = 60     # must stay below publishing.job_ttl_secs
    utc_offset = \"+00:00\"

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Poll interval in seconds (overrides config)
    #[arg(long, value_name = "SECONDS")]
    poll_interval: Option<u64>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Process due posts once and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env(cli.verbose, "info").init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let poll_interval = cli
        .poll_interval
        .unwrap_or(config.scheduling.poll_interval_secs)
        .max(1);
    config.check_poll_interval(poll_interval)?;
    let service = GramcastService::from_config(config).await?;

    info!("gram-send daemon starting");

    if cli.once {
        process_once(&service).await?;
        sweep_temp_files(&service);
        info!("gram-send: processed posts once, exiting");
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    info!("Poll interval: {}s", poll_interval);
    run_daemon_loop(&service, poll_interval, shutdown).await;

    info!("gram-send daemon stopped");
    Ok(())
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(|e| {
        libgramcast::GramcastError::InvalidInput(format!("Signal setup failed: {}", e))
    })?;

    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            info!("Received shutdown signal, stopping gracefully...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(_shutdown: Arc<AtomicBool>) -> Result<()> {
    Ok(())
}

async fn run_daemon_loop(service: &GramcastService, poll_interval: u64, shutdown: Arc<AtomicBool>) {
    sweep_temp_files(service);
    let mut last_cleanup = Instant::now();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("Shutdown requested, stopping daemon loop");
            break;
        }

        if let Err(e) = process_once(service).await {
            error!("Error processing scheduled posts: {}", e);
        }

        if last_cleanup.elapsed() >= CLEANUP_INTERVAL {
            sweep_temp_files(service);
            last_cleanup = Instant::now();
        }

        // Sleep until next poll (check shutdown every second)
        for _ in 0..poll_interval {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }
}

/// Refresh the token if due, then run one scheduler tick
async fn process_once(service: &GramcastService) -> Result<()> {
    if let Err(e) = service.refresh_credentials_if_needed().await {
        warn!("Access token refresh failed: {}", e);
    }

    let report = service.scheduler().tick().await?;
    if report.published + report.failed + report.processing == 0 {
        tracing::debug!("No scheduled posts due ({} waiting)", report.waiting);
    }
    Ok(())
}

fn sweep_temp_files(service: &GramcastService) {
    if let Err(e) = service.cleanup_temp_files() {
        warn!("Temp cleanup failed: {}", e);
    }
}
