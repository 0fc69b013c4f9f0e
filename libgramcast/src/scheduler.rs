//! Deferred publishing
//!
//! Scheduled posts live in the `scheduled_posts` table until their time
//! comes. Something external (the `gram-send` daemon, or cron running
//! `gram-send --once`) calls [`Scheduler::tick`] periodically; each tick
//! starts every due post and follows up on posts whose publish job was still
//! processing at the previous tick.
//!
//! Posts that publish are deleted. Posts that fail are kept with status
//! `failed` and are never retried automatically.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::crop::ImageCropper;
use crate::db::Database;
use crate::error::{GramcastError, Result};
use crate::publisher::{Outcome, Publisher};
use crate::types::{CropRect, ImageSource, ScheduledPost, ScheduledStatus};

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

/// Message stored when a handed-off job disappears before publishing
pub const EXPIRED_JOB_MESSAGE: &str = "publish job expired before completion";

/// Input to [`Scheduler::schedule`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewScheduledPost {
    pub correlation_id: String,
    pub images: Vec<ImageSource>,
    #[serde(default)]
    pub crops: Vec<Option<CropRect>>,
    pub caption: String,
    /// When to publish; see [`parse_schedule_time`] for accepted forms
    pub publish_at: String,
}

/// What a tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Posts published and removed
    pub published: usize,
    /// Posts marked failed
    pub failed: usize,
    /// Posts whose publish job is still processing
    pub processing: usize,
    /// Pending posts not yet due
    pub waiting: usize,
}

pub struct Scheduler {
    db: Database,
    publisher: Arc<Publisher>,
    cropper: Arc<dyn ImageCropper>,
    offset: FixedOffset,
}

impl Scheduler {
    /// `offset` is the zone naive schedule times are read in
    pub fn new(
        db: Database,
        publisher: Arc<Publisher>,
        cropper: Arc<dyn ImageCropper>,
        offset: FixedOffset,
    ) -> Self {
        Self {
            db,
            publisher,
            cropper,
            offset,
        }
    }

    /// Validate and store a post for later publishing
    pub async fn schedule(&self, new_post: NewScheduledPost) -> Result<ScheduledPost> {
        if new_post.correlation_id.trim().is_empty() {
            return Err(GramcastError::InvalidInput(
                "A correlation id is required".to_string(),
            ));
        }
        if new_post.images.is_empty() {
            return Err(GramcastError::InvalidInput(
                "At least one image is required".to_string(),
            ));
        }
        if new_post.crops.len() > new_post.images.len() {
            return Err(GramcastError::InvalidInput(format!(
                "{} crop rectangles given for {} images",
                new_post.crops.len(),
                new_post.images.len()
            )));
        }
        for image in &new_post.images {
            if !self.cropper.source_exists(image).await {
                return Err(GramcastError::InvalidInput(format!(
                    "Image {} not found at {}",
                    image.id, image.reference
                )));
            }
        }

        let now = Utc::now();
        let publish_at = parse_schedule_time(&new_post.publish_at, self.offset, now)?;

        let post = ScheduledPost {
            id: format!("sched_{}", uuid::Uuid::new_v4().simple()),
            correlation_id: new_post.correlation_id,
            images: new_post.images,
            crops: new_post.crops,
            caption: new_post.caption,
            publish_at: publish_at.timestamp(),
            created_at: now.timestamp(),
            status: ScheduledStatus::Pending,
            error_message: None,
            job_key: None,
        };
        self.db.create_scheduled_post(&post).await?;

        info!(
            "Scheduled post {} for {} ({} images)",
            post.id,
            publish_at.with_timezone(&self.offset),
            post.images.len()
        );
        Ok(post)
    }

    /// Scheduled posts for one correlation id, or all of them
    pub async fn list(&self, correlation_id: Option<&str>) -> Result<Vec<ScheduledPost>> {
        self.db.list_scheduled_posts(correlation_id).await
    }

    /// Process every due pending post and follow up on processing ones
    pub async fn tick(&self) -> Result<TickReport> {
        let now = Utc::now().timestamp();
        let posts = self.db.get_active_scheduled_posts().await?;
        let mut report = TickReport::default();

        for post in posts {
            let step = match post.status {
                ScheduledStatus::Pending if post.is_due(now) => self.publish_due(&post).await,
                ScheduledStatus::Pending => {
                    report.waiting += 1;
                    continue;
                }
                ScheduledStatus::Processing => self.follow_up(&post).await,
                ScheduledStatus::Failed => continue,
            };

            match step {
                Ok(Step::Published) => report.published += 1,
                Ok(Step::Failed) => report.failed += 1,
                Ok(Step::Processing) => report.processing += 1,
                Err(e) => warn!("Failed to update scheduled post {}: {}", post.id, e),
            }
        }

        if report != TickReport::default() {
            info!(
                "Scheduler tick: {} published, {} failed, {} processing, {} waiting",
                report.published, report.failed, report.processing, report.waiting
            );
        }
        Ok(report)
    }

    async fn publish_due(&self, post: &ScheduledPost) -> Result<Step> {
        debug!("Scheduled post {} is due", post.id);
        let outcome = self.publisher.start(&post.to_request()).await;
        self.apply(post, outcome).await
    }

    async fn follow_up(&self, post: &ScheduledPost) -> Result<Step> {
        let Some(job_key) = post.job_key.as_deref() else {
            return self
                .mark_failed(post, "processing post has no publish job")
                .await;
        };
        let outcome = self.publisher.continue_job(job_key).await;
        self.apply(post, outcome).await
    }

    async fn apply(&self, post: &ScheduledPost, outcome: Outcome) -> Result<Step> {
        match outcome {
            Outcome::Completed(result) if result.success => {
                self.db.delete_scheduled_post(&post.id).await?;
                info!("Scheduled post {}: {}", post.id, result.message);
                Ok(Step::Published)
            }
            Outcome::Completed(result) => self.mark_failed(post, &result.message).await,
            Outcome::Failed(message) => self.mark_failed(post, &message).await,
            Outcome::NotFound => self.mark_failed(post, EXPIRED_JOB_MESSAGE).await,
            Outcome::Processing(progress) => {
                if post.status != ScheduledStatus::Processing
                    || post.job_key.as_deref() != Some(progress.job_key.as_str())
                {
                    self.db
                        .update_scheduled_status(
                            &post.id,
                            ScheduledStatus::Processing,
                            None,
                            Some(&progress.job_key),
                        )
                        .await?;
                    info!(
                        "Scheduled post {} handed to publish job {}",
                        post.id, progress.job_key
                    );
                }
                Ok(Step::Processing)
            }
        }
    }

    async fn mark_failed(&self, post: &ScheduledPost, message: &str) -> Result<Step> {
        self.db
            .update_scheduled_status(&post.id, ScheduledStatus::Failed, Some(message), None)
            .await?;
        warn!("Scheduled post {} failed: {}", post.id, message);
        Ok(Step::Failed)
    }
}

enum Step {
    Published,
    Failed,
    Processing,
}

/// Parse a schedule time
///
/// Accepted, in order:
/// - RFC 3339 with an offset: `2025-11-20T15:00:00+02:00`
/// - a naive date and time, read in `offset`: `2025-11-20 15:00`
/// - a duration from `now`: `30m`, `2h`, `1day`
/// - natural language, read in `offset`: `tomorrow`, `next friday 9am`
pub fn parse_schedule_time(
    input: &str,
    offset: FixedOffset,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(GramcastError::InvalidInput(
            "Schedule time cannot be empty".to_string(),
        ));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return offset
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| {
                    GramcastError::InvalidInput(format!("Ambiguous schedule time: {}", input))
                });
        }
    }

    if let Ok(duration) = humantime::parse_duration(input) {
        let duration = chrono::Duration::from_std(duration)
            .map_err(|_| GramcastError::InvalidInput("Duration out of range".to_string()))?;
        return now
            .checked_add_signed(duration)
            .ok_or_else(|| GramcastError::InvalidInput("Duration out of range".to_string()));
    }

    chrono_english::parse_date_string(
        input,
        now.with_timezone(&offset),
        chrono_english::Dialect::Us,
    )
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|_| GramcastError::InvalidInput(format!("Could not parse schedule time: {}", input)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_parse_rfc3339() {
        let dt = parse_schedule_time("2025-11-20T15:00:00+02:00", utc(), fixed_now()).unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-11-20T13:00:00+00:00");
    }

    #[test]
    fn test_parse_naive_uses_configured_offset() {
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();

        let dt = parse_schedule_time("2025-11-20 15:00", plus_two, fixed_now()).unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-11-20T13:00:00+00:00");

        let dt = parse_schedule_time("2025-11-20T15:00:30", utc(), fixed_now()).unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-11-20T15:00:30+00:00");
    }

    #[test]
    fn test_parse_duration_from_now() {
        let dt = parse_schedule_time("2h", utc(), fixed_now()).unwrap();
        assert_eq!((dt - fixed_now()).num_minutes(), 120);

        let dt = parse_schedule_time("30m", utc(), fixed_now()).unwrap();
        assert_eq!((dt - fixed_now()).num_minutes(), 30);
    }

    #[test]
    fn test_parse_natural_language() {
        let dt = parse_schedule_time("tomorrow", utc(), fixed_now()).unwrap();
        let diff = (dt - fixed_now()).num_hours();
        assert!((0..=48).contains(&diff), "Expected within two days, got {}", diff);
    }

    #[test]
    fn test_parse_empty_and_garbage() {
        assert!(parse_schedule_time("  ", utc(), fixed_now()).is_err());

        let err = parse_schedule_time("not a time at all", utc(), fixed_now()).unwrap_err();
        assert!(matches!(err, GramcastError::InvalidInput(_)));
    }

    #[test]
    fn test_past_times_are_accepted() {
        let dt = parse_schedule_time("2020-01-01 00:00", utc(), fixed_now()).unwrap();
        assert!(dt < fixed_now());
    }
}
