//! gram-post - Publish images to Instagram

use clap::Parser;
use libgramcast::crop::jpeg::JpegCropper;
use libgramcast::logging::LoggingConfig;
use libgramcast::publisher::Outcome;
use libgramcast::scheduler::NewScheduledPost;
use libgramcast::service::GramcastService;
use libgramcast::{
    Config, CropRect, GramcastError, ImageSource, PublishRequest, Result, ScheduledPost,
    StatusReport,
};
use std::io::{IsTerminal, Read};
use std::time::Duration;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "gram-post")]
#[command(version)]
#[command(about = "Publish images to Instagram")]
#[command(long_about = "\
gram-post - Publish images to Instagram

DESCRIPTION:
    Publishes one image as a single post, or up to ten images as a carousel.
    Each image is cropped, uploaded to Instagram as a container, and published
    once Instagram has finished processing every container.

    Instagram processes containers asynchronously. If they are not ready on
    the first check, gram-post prints a job key and exits; advance the job
    with `gram-queue status <JOB_KEY>` or let gram-send pick it up. Use
    --wait to keep polling instead.

USAGE EXAMPLES:
    # Single image, caption from the command line
    gram-post --image sunset.jpg --caption \"Golden hour\"

    # Carousel with an explicit crop for the first image
    gram-post -i a.jpg -i b.jpg --crop 0,135,1080,1080 --caption \"Trip\"

    # Caption from stdin
    echo \"Golden hour\" | gram-post --image sunset.jpg

    # Publish tomorrow at 9
    gram-post --image sunset.jpg --caption \"Later\" --schedule \"tomorrow 9am\"

EXIT CODES:
    0 - Published, still processing, or scheduled
    1 - Publishing failed
    2 - Configuration or credential error
    3 - Invalid input
")]
struct Cli {
    /// Image file to publish (repeat for a carousel)
    #[arg(short, long = "image", value_name = "PATH", required = true)]
    images: Vec<String>,

    /// Crop rectangle for the image at the same position
    #[arg(long = "crop", value_name = "X,Y,W,H")]
    crops: Vec<String>,

    /// Caption (reads from stdin if not provided)
    #[arg(short, long)]
    caption: Option<String>,

    /// Groups the images of one post in the shared-image history
    #[arg(long, value_name = "ID")]
    correlation_id: Option<String>,

    /// Publish later instead of now (e.g. "2h", "tomorrow 9am", "2025-11-20 15:00")
    #[arg(short, long, value_name = "TIME")]
    schedule: Option<String>,

    /// Keep polling until the post is published or fails
    #[arg(short, long)]
    wait: bool,

    /// Seconds between polls with --wait
    #[arg(long, value_name = "SECONDS", default_value_t = 5)]
    poll_interval: u64,

    /// Output format (text or json)
    #[arg(short, long, default_value = "text")]
    format: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
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

/// Returns whether the post was accepted
async fn run(cli: Cli) -> Result<bool> {
    let json = match cli.format.as_str() {
        "text" => false,
        "json" => true,
        other => {
            return Err(GramcastError::InvalidInput(format!(
                "Invalid format '{}'. Must be 'text' or 'json'",
                other
            )))
        }
    };

    let images = cli
        .images
        .iter()
        .map(|path| image_source(path))
        .collect::<Result<Vec<_>>>()?;
    let crops = cli
        .crops
        .iter()
        .map(|value| parse_crop(value).map(Some))
        .collect::<Result<Vec<_>>>()?;
    let caption = read_caption(cli.caption)?;
    let correlation_id = cli
        .correlation_id
        .unwrap_or_else(|| format!("post-{}", uuid::Uuid::new_v4().simple()));

    let config = Config::load()?;
    let service = GramcastService::from_config(config).await?;

    if let Some(time) = cli.schedule {
        let post = service
            .scheduler()
            .schedule(NewScheduledPost {
                correlation_id,
                images,
                crops,
                caption,
                publish_at: time,
            })
            .await?;
        print_scheduled(&post, json);
        return Ok(true);
    }

    let mut request = PublishRequest::new(images, caption, correlation_id);
    request.crops = crops;

    let mut outcome = service.publisher().start(&request).await;
    if cli.wait {
        while let Outcome::Processing(progress) = &outcome {
            debug!(
                "Job {}: {} of {} containers ready",
                progress.job_key, progress.ready, progress.total
            );
            tokio::time::sleep(wait_interval(cli.poll_interval)).await;
            let key = progress.job_key.clone();
            outcome = service.publisher().continue_job(&key).await;
        }
    }

    Ok(print_outcome(outcome, json))
}

fn image_source(path: &str) -> Result<ImageSource> {
    let expanded = libgramcast::config::expand_path(path);
    if !expanded.is_file() {
        return Err(GramcastError::InvalidInput(format!(
            "Image not found: {}",
            path
        )));
    }
    let (width, height) = JpegCropper::probe(&expanded)?;
    let id = expanded
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string());

    Ok(ImageSource {
        id,
        reference: expanded.to_string_lossy().to_string(),
        width,
        height,
    })
}

/// Parse "x,y,width,height"
/// Delay between `--wait` polls, never shorter than a second
fn wait_interval(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}

fn parse_crop(value: &str) -> Result<CropRect> {
    let invalid = || {
        GramcastError::InvalidInput(format!(
            "Invalid crop '{}'. Expected X,Y,WIDTH,HEIGHT",
            value
        ))
    };

    let parts = value
        .split(',')
        .map(|part| part.trim().parse::<f64>().map_err(|_| invalid()))
        .collect::<Result<Vec<_>>>()?;
    match parts.as_slice() {
        [x, y, width, height] => Ok(CropRect {
            x: *x,
            y: *y,
            width: *width,
            height: *height,
        }),
        _ => Err(invalid()),
    }
}

fn read_caption(caption: Option<String>) -> Result<String> {
    if let Some(caption) = caption {
        return Ok(caption);
    }

    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Ok(String::new());
    }
    let mut buffer = String::new();
    stdin
        .lock()
        .read_to_string(&mut buffer)
        .map_err(|e| GramcastError::InvalidInput(format!("Failed to read stdin: {}", e)))?;
    Ok(buffer.trim_end().to_string())
}

fn print_scheduled(post: &ScheduledPost, json: bool) {
    let publish_at = chrono::DateTime::from_timestamp(post.publish_at, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| post.publish_at.to_string());

    if json {
        println!(
            "{}",
            serde_json::json!({
                "status": "scheduled",
                "id": post.id,
                "correlation_id": post.correlation_id,
                "publish_at": publish_at,
            })
        );
    } else {
        println!("{}", post.id);
        eprintln!("Scheduled for {}", publish_at);
    }
}

/// Print the outcome, returning false for failures
fn print_outcome(outcome: Outcome, json: bool) -> bool {
    let report = StatusReport::from(outcome);
    let accepted = !matches!(report, StatusReport::Error { .. } | StatusReport::NotFound);

    if json {
        match serde_json::to_string(&report) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("Error: failed to encode report: {}", e),
        }
        return accepted;
    }

    match report {
        StatusReport::Completed { message, .. } => println!("{}", message),
        StatusReport::Processing { job_key, .. } | StatusReport::Publishing { job_key, .. } => {
            println!("{}", job_key);
            eprintln!(
                "Instagram is still processing; continue with: gram-queue status {}",
                job_key
            );
        }
        StatusReport::Error { message } => eprintln!("Error: {}", message),
        StatusReport::NotFound => eprintln!("Error: publish job expired before completion"),
    }
    accepted
}
