//! gram-queue - Inspect scheduled posts and publish jobs
//!
//! Unix-style tool over the Gramcast database.

use clap::{Parser, Subcommand};
use libgramcast::logging::LoggingConfig;
use libgramcast::service::GramcastService;
use libgramcast::{Config, GramcastError, Result, ScheduledPost, SharedImage, StatusReport};

#[derive(Parser, Debug)]
#[command(name = "gram-queue")]
#[command(version)]
#[command(about = "Inspect scheduled posts and publish jobs")]
#[command(long_about = "\
gram-queue - Inspect scheduled posts and publish jobs

COMMANDS:
    list     List scheduled posts
    status   Advance a publish job one step and report where it stands
    shared   Show images already posted for a correlation id

USAGE EXAMPLES:
    # List all scheduled posts
    gram-queue list

    # Only the posts of one correlation id, as JSON
    gram-queue list --correlation-id post-42 --format json

    # Poll a job started by gram-post
    gram-queue status gram_job_3f2a...

    # Which images of post-42 are already on Instagram
    gram-queue shared post-42

CONFIGURATION:
    Configuration file: ~/.config/gramcast/config.toml

    Override with environment variables:
        GRAMCAST_CONFIG    - Path to config file
        GRAMCAST_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Job failed or not found
    2 - Database or configuration error
    3 - Invalid input
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List scheduled posts
    List {
        /// Only posts with this correlation id
        #[arg(long)]
        correlation_id: Option<String>,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Advance a publish job and print its status
    Status {
        /// Job key printed by gram-post
        job_key: String,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show images already shared for a correlation id
    Shared {
        correlation_id: String,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::from_env(cli.verbose, "error").init();

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let format = match &cli.command {
        Commands::List { format, .. }
        | Commands::Status { format, .. }
        | Commands::Shared { format, .. } => format.clone(),
    };
    let json = parse_format(&format)?;

    let config = Config::load()?;
    let service = GramcastService::from_config(config).await?;

    match cli.command {
        Commands::List { correlation_id, .. } => {
            let posts = service
                .scheduler()
                .list(correlation_id.as_deref())
                .await?;
            output_list(&posts, json)?;
            Ok(true)
        }
        Commands::Status { job_key, .. } => {
            let report = service.reporter().status(&job_key).await;
            output_status(&report, json)?;
            Ok(!matches!(
                report,
                StatusReport::Error { .. } | StatusReport::NotFound
            ))
        }
        Commands::Shared { correlation_id, .. } => {
            let shared = service.database().get_shared_images(&correlation_id).await?;
            output_shared(&shared, json)?;
            Ok(true)
        }
    }
}

fn parse_format(format: &str) -> Result<bool> {
    match format {
        "text" => Ok(false),
        "json" => Ok(true),
        other => Err(GramcastError::InvalidInput(format!(
            "Invalid format '{}'. Must be 'text' or 'json'",
            other
        ))),
    }
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| GramcastError::InvalidInput(format!("Failed to encode output: {}", e)))
}

fn output_list(posts: &[ScheduledPost], json: bool) -> Result<()> {
    if json {
        println!("{}", to_json(posts)?);
        return Ok(());
    }

    let now = chrono::Utc::now().timestamp();
    for post in posts {
        let when = match post.error_message.as_deref() {
            Some(message) => message.to_string(),
            None => format_time_until(now, post.publish_at),
        };
        println!(
            "{} | {} | {} image{} | {} | {}",
            post.id,
            post.correlation_id,
            post.images.len(),
            if post.images.len() == 1 { "" } else { "s" },
            post.status,
            when
        );
    }
    Ok(())
}

fn output_status(report: &StatusReport, json: bool) -> Result<()> {
    if json {
        println!("{}", to_json(report)?);
        return Ok(());
    }

    match report {
        StatusReport::Processing {
            ready_count,
            total_count,
            ..
        } => println!("processing ({}/{} ready)", ready_count, total_count),
        StatusReport::Publishing { .. } => println!("publishing"),
        StatusReport::Completed { message, .. } => println!("{}", message),
        StatusReport::Error { message } => eprintln!("Error: {}", message),
        StatusReport::NotFound => eprintln!("Error: job not found or expired"),
    }
    Ok(())
}

fn output_shared(shared: &[SharedImage], json: bool) -> Result<()> {
    if json {
        println!("{}", to_json(shared)?);
        return Ok(());
    }

    for image in shared {
        println!(
            "{} | {} | {}",
            image.image_id,
            image.media_id,
            image.permalink.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

/// Format time until scheduled time in human-readable format
fn format_time_until(now: i64, scheduled_at: i64) -> String {
    let diff = scheduled_at - now;

    if diff < 0 {
        return "overdue".to_string();
    }

    let minutes = diff / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("in {} day{}", days, if days == 1 { "" } else { "s" })
    } else if hours > 0 {
        format!("in {} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else if minutes > 0 {
        format!("in {} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        "in <1 minute".to_string()
    }
}
