//! Core types for Gramcast

use serde::{Deserialize, Serialize};

/// Instagram carousel posts accept at most this many items
pub const MAX_CAROUSEL_ITEMS: usize = 10;

/// Instagram caption length limit, in characters
pub const MAX_CAPTION_CHARS: usize = 2200;

/// A source image selected for posting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    /// Caller's identity for the image (e.g. a media library attachment id)
    pub id: String,
    /// Local file path or public URL
    pub reference: String,
    pub width: u32,
    pub height: u32,
}

/// Pixel rectangle within a source image
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Input to the publish workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub images: Vec<ImageSource>,
    pub caption: String,
    /// Identifier of the content the images belong to; keys the shared-image ledger
    pub correlation_id: String,
    /// Crop per image, aligned with `images`. `None` falls back to a centered crop.
    #[serde(default)]
    pub crops: Vec<Option<CropRect>>,
}

impl PublishRequest {
    pub fn new(images: Vec<ImageSource>, caption: String, correlation_id: String) -> Self {
        Self {
            images,
            caption,
            correlation_id,
            crops: Vec::new(),
        }
    }

    /// Crop for the image at `index`, if one was supplied
    pub fn crop_for(&self, index: usize) -> Option<CropRect> {
        self.crops.get(index).copied().flatten()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Pending,
    Ready,
    Failed,
}

/// One remote item container per image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub image_id: String,
    /// URL of the cropped JPEG handed to Instagram
    pub image_url: String,
    pub container_id: String,
    pub status: ContainerStatus,
}

/// Durable record of an in-flight publish attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishJob {
    pub key: String,
    pub correlation_id: String,
    pub containers: Vec<ContainerRecord>,
    pub caption: String,
    pub carousel: bool,
    pub publishing: bool,
    pub publishing_started: Option<i64>,
    pub published: bool,
    pub created_at: i64,
    pub expires_at: i64,
    /// Set once `published` is true
    pub result: Option<PublishResult>,
}

impl PublishJob {
    pub fn new(
        correlation_id: String,
        containers: Vec<ContainerRecord>,
        caption: String,
        carousel: bool,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            key: new_job_key(),
            correlation_id,
            containers,
            caption,
            carousel,
            publishing: false,
            publishing_started: None,
            published: false,
            created_at: now,
            expires_at: now,
            result: None,
        }
    }

    pub fn ready_count(&self) -> usize {
        self.count(ContainerStatus::Ready)
    }

    pub fn pending_count(&self) -> usize {
        self.count(ContainerStatus::Pending)
    }

    pub fn total_count(&self) -> usize {
        self.containers.len()
    }

    fn count(&self, status: ContainerStatus) -> usize {
        self.containers.iter().filter(|c| c.status == status).count()
    }

    /// Take the publish lease
    pub fn acquire_lease(&mut self, now: i64) {
        self.publishing = true;
        self.publishing_started = Some(now);
    }

    /// Whether another invocation holds a lease younger than `stale_after_secs`
    pub fn lease_held(&self, now: i64, stale_after_secs: i64) -> bool {
        match (self.publishing, self.publishing_started) {
            (true, Some(started)) => now - started < stale_after_secs,
            _ => false,
        }
    }

    /// Record a successful publish; `published` never flips back
    pub fn mark_published(&mut self, result: PublishResult) {
        self.published = true;
        self.publishing = false;
        self.publishing_started = None;
        self.result = Some(result);
    }
}

/// Generate a unique key for a new publish job
pub fn new_job_key() -> String {
    format!("gram_job_{}", uuid::Uuid::new_v4().simple())
}

/// Terminal output of a publish attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishResult {
    pub success: bool,
    pub media_id: String,
    pub permalink: Option<String>,
    pub message: String,
    pub warning: Option<String>,
}

impl PublishResult {
    pub fn published(media_id: String, permalink: Option<String>) -> Self {
        match permalink {
            Some(link) => Self {
                success: true,
                message: format!("Posted to Instagram. View post: {}", link),
                media_id,
                permalink: Some(link),
                warning: None,
            },
            None => Self {
                success: true,
                message: format!(
                    "Posted to Instagram. Media ID: {} (no permalink found)",
                    media_id
                ),
                media_id,
                permalink: None,
                warning: Some("No permalink returned from Instagram.".to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduledStatus {
    Pending,
    /// Handed to a publish job that was still processing at tick time
    Processing,
    Failed,
}

impl ScheduledStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScheduledStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A post waiting for its publish time
///
/// Successfully published entries are deleted rather than marked, so a missing
/// record means either never scheduled or already posted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledPost {
    pub id: String,
    pub correlation_id: String,
    pub images: Vec<ImageSource>,
    pub crops: Vec<Option<CropRect>>,
    pub caption: String,
    /// Unix timestamp (UTC)
    pub publish_at: i64,
    pub created_at: i64,
    pub status: ScheduledStatus,
    pub error_message: Option<String>,
    pub job_key: Option<String>,
}

impl ScheduledPost {
    pub fn is_due(&self, now: i64) -> bool {
        self.publish_at <= now
    }

    pub fn to_request(&self) -> PublishRequest {
        PublishRequest {
            images: self.images.clone(),
            caption: self.caption.clone(),
            correlation_id: self.correlation_id.clone(),
            crops: self.crops.clone(),
        }
    }
}

/// Ledger entry linking a source image to the Instagram media it was posted in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedImage {
    pub correlation_id: String,
    pub image_id: String,
    pub media_id: String,
    pub permalink: Option<String>,
    pub shared_at: i64,
}
