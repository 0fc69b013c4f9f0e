//! Publish workflow orchestration
//!
//! A post moves through these stages:
//!
//! 1. every image is cropped and gets an item container,
//! 2. each container is checked once,
//! 3. if all are ready the post is assembled and published right away,
//! 4. otherwise a [`PublishJob`] is stored and later calls to
//!    [`Publisher::continue_job`] poll again until everything is ready.
//!
//! No call ever waits for Instagram to finish processing. Progress is driven
//! by whoever calls `continue_job` next (a status poll or a scheduler tick).
//!
//! Publishing itself is guarded by a lease stored on the job. A caller that
//! finds a fresh lease reports [`Progress::publishing`] instead of publishing
//! again. The lease is a read-modify-write on the job record, so it only
//! excludes callers that respect it; two processes racing on the same store
//! can still both win.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::PublishingConfig;
use crate::credentials::{Credential, CredentialProvider};
use crate::crop::{center_crop, validate_crop, ImageCropper};
use crate::db::Database;
use crate::error::{GramcastError, Result};
use crate::graph::{PublishClient, RemoteContainerStatus};
use crate::jobs::JobStore;
use crate::types::{
    ContainerRecord, ContainerStatus, PublishJob, PublishRequest, PublishResult, SharedImage,
    MAX_CAPTION_CHARS, MAX_CAROUSEL_ITEMS,
};

/// Tunables for [`Publisher`]
#[derive(Debug, Clone)]
pub struct PublishSettings {
    /// How long a job lives after its last progress step
    pub job_ttl: Duration,
    /// Age after which another caller may take over a publish lease
    pub lease_stale_secs: i64,
    /// Width/height ratio used when an image has no crop rectangle
    pub aspect_ratio: f64,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            job_ttl: Duration::from_secs(300),
            lease_stale_secs: 180,
            aspect_ratio: 1.0,
        }
    }
}

impl From<&PublishingConfig> for PublishSettings {
    fn from(config: &PublishingConfig) -> Self {
        Self {
            job_ttl: config.job_ttl(),
            lease_stale_secs: config.lease_stale_secs as i64,
            aspect_ratio: config.aspect_ratio,
        }
    }
}

/// Snapshot of an unfinished job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub job_key: String,
    pub ready: usize,
    pub pending: usize,
    pub total: usize,
    /// Another caller holds the publish lease
    pub publishing: bool,
}

impl Progress {
    fn of(job: &PublishJob, publishing: bool) -> Self {
        Self {
            job_key: job.key.clone(),
            ready: job.ready_count(),
            pending: job.pending_count(),
            total: job.total_count(),
            publishing,
        }
    }
}

/// Result of one step of the workflow
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(PublishResult),
    Processing(Progress),
    Failed(String),
    NotFound,
}

/// Drives publish requests through the Instagram container workflow
pub struct Publisher {
    client: Arc<dyn PublishClient>,
    credentials: Arc<dyn CredentialProvider>,
    cropper: Arc<dyn ImageCropper>,
    jobs: Arc<dyn JobStore>,
    ledger: Database,
    settings: PublishSettings,
    /// Serializes job read-modify-write made through this publisher
    lease_guard: Mutex<()>,
}

impl Publisher {
    pub fn new(
        client: Arc<dyn PublishClient>,
        credentials: Arc<dyn CredentialProvider>,
        cropper: Arc<dyn ImageCropper>,
        jobs: Arc<dyn JobStore>,
        ledger: Database,
        settings: PublishSettings,
    ) -> Self {
        Self {
            client,
            credentials,
            cropper,
            jobs,
            ledger,
            settings,
            lease_guard: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &PublishSettings {
        &self.settings
    }

    /// Begin publishing a request
    ///
    /// Returns `Completed` when every container was ready on the first check,
    /// `Processing` with a job key when some are still being processed, and
    /// `Failed` for anything else. No job is stored unless `Processing` is
    /// returned.
    pub async fn start(&self, request: &PublishRequest) -> Outcome {
        match self.try_start(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Publish for {} failed: {}", request.correlation_id, e);
                Outcome::Failed(e.to_string())
            }
        }
    }

    async fn try_start(&self, request: &PublishRequest) -> Result<Outcome> {
        let credential = self.usable_credential()?;
        self.validate(request)?;

        let carousel = request.images.len() > 1;
        let containers = self.create_containers(&credential, request, carousel).await?;
        let containers = match self.check_containers(&credential, containers).await? {
            Checked::Failed(reason) => return Ok(Outcome::Failed(reason)),
            Checked::Polled(containers) => containers,
        };

        if containers.iter().all(|c| c.status == ContainerStatus::Ready) {
            info!(
                "All {} containers for {} ready on first check",
                containers.len(),
                request.correlation_id
            );
            let result = self
                .assemble_and_publish(
                    &credential,
                    &request.correlation_id,
                    &containers,
                    &request.caption,
                    carousel,
                )
                .await?;
            return Ok(Outcome::Completed(result));
        }

        let mut job = PublishJob::new(
            request.correlation_id.clone(),
            containers,
            request.caption.clone(),
            carousel,
        );
        self.renew(&mut job).await?;

        info!(
            "Created publish job {} ({} of {} containers ready)",
            job.key,
            job.ready_count(),
            job.total_count()
        );
        Ok(Outcome::Processing(Progress::of(&job, false)))
    }

    /// Advance a stored job by one polling round
    ///
    /// Safe to call repeatedly. Once a job has been published, further calls
    /// return the stored result without contacting Instagram until the job
    /// expires.
    pub async fn continue_job(&self, job_key: &str) -> Outcome {
        match self.try_continue(job_key).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Continuing job {} failed: {}", job_key, e);
                Outcome::Failed(e.to_string())
            }
        }
    }

    async fn try_continue(&self, job_key: &str) -> Result<Outcome> {
        let Some(job) = self.jobs.get(job_key).await? else {
            debug!("Job {} not found", job_key);
            return Ok(Outcome::NotFound);
        };

        if job.published {
            return Ok(published_outcome(&job));
        }

        let credential = self.usable_credential()?;

        let polled = match self.check_containers(&credential, job.containers).await? {
            Checked::Polled(containers) => containers,
            Checked::Failed(reason) => {
                self.jobs.delete(job_key).await?;
                warn!("Job {} aborted: {}", job_key, reason);
                return Ok(Outcome::Failed(reason));
            }
        };

        // Re-read under the guard so a concurrent caller's lease is never
        // overwritten with a stale copy
        let guard = self.lease_guard.lock().await;

        let Some(mut job) = self.jobs.get(job_key).await? else {
            return Ok(Outcome::NotFound);
        };
        if job.published {
            return Ok(published_outcome(&job));
        }

        let now = chrono::Utc::now().timestamp();
        if job.lease_held(now, self.settings.lease_stale_secs) {
            debug!("Job {} is being published by another caller", job_key);
            return Ok(Outcome::Processing(Progress::of(&job, true)));
        }

        let advanced = merge_ready(&mut job.containers, &polled);
        if advanced {
            job.expires_at = now + self.settings.job_ttl.as_secs() as i64;
        }

        if job.pending_count() > 0 {
            if advanced {
                self.jobs.put(&job.key, &job, self.settings.job_ttl).await?;
            }
            return Ok(Outcome::Processing(Progress::of(&job, false)));
        }

        if job.publishing {
            warn!("Taking over stale publish lease on job {}", job_key);
        }
        job.acquire_lease(now);
        self.jobs.put(&job.key, &job, remaining_ttl(&job)).await?;
        drop(guard);

        let published = self
            .assemble_and_publish(
                &credential,
                &job.correlation_id,
                &job.containers,
                &job.caption,
                job.carousel,
            )
            .await;

        match published {
            Ok(result) => {
                job.mark_published(result.clone());
                // Kept only as a completion marker, so the ttl is not renewed
                if let Err(e) = self.jobs.put(&job.key, &job, remaining_ttl(&job)).await {
                    warn!("Failed to store completion of job {}: {}", job.key, e);
                }
                Ok(Outcome::Completed(result))
            }
            Err(e) => {
                self.jobs.delete(job_key).await?;
                warn!("Publishing job {} failed: {}", job_key, e);
                Ok(Outcome::Failed(e.to_string()))
            }
        }
    }

    fn usable_credential(&self) -> Result<Credential> {
        match self.credentials.credential() {
            Some(credential) if self.credentials.is_valid() => Ok(credential),
            Some(_) => Err(GramcastError::Credential(
                "Instagram access token has expired; re-authorize the account".to_string(),
            )),
            None => Err(GramcastError::Credential(
                "No Instagram account is authorized".to_string(),
            )),
        }
    }

    fn validate(&self, request: &PublishRequest) -> Result<()> {
        if request.images.is_empty() {
            return Err(GramcastError::InvalidInput(
                "At least one image is required".to_string(),
            ));
        }
        if request.images.len() > MAX_CAROUSEL_ITEMS {
            return Err(GramcastError::InvalidInput(format!(
                "Instagram allows at most {} images per post, got {}",
                MAX_CAROUSEL_ITEMS,
                request.images.len()
            )));
        }
        let caption_len = request.caption.chars().count();
        if caption_len > MAX_CAPTION_CHARS {
            return Err(GramcastError::InvalidInput(format!(
                "Caption is {} characters, Instagram allows {}",
                caption_len, MAX_CAPTION_CHARS
            )));
        }
        if request.crops.len() > request.images.len() {
            return Err(GramcastError::InvalidInput(format!(
                "{} crop rectangles given for {} images",
                request.crops.len(),
                request.images.len()
            )));
        }

        for (index, image) in request.images.iter().enumerate() {
            match request.crop_for(index) {
                Some(rect) => validate_crop(&rect, image.width, image.height).map_err(|reason| {
                    GramcastError::InvalidInput(format!("Image {}: {}", image.id, reason))
                })?,
                None if image.width == 0 || image.height == 0 => {
                    return Err(GramcastError::InvalidInput(format!(
                        "Image {} has no dimensions to derive a crop from",
                        image.id
                    )));
                }
                None => {}
            }
        }
        Ok(())
    }

    async fn create_containers(
        &self,
        credential: &Credential,
        request: &PublishRequest,
        carousel: bool,
    ) -> Result<Vec<ContainerRecord>> {
        let caption = if carousel {
            None
        } else {
            Some(request.caption.as_str())
        };

        let mut containers = Vec::with_capacity(request.images.len());
        for (index, image) in request.images.iter().enumerate() {
            let rect = request.crop_for(index).unwrap_or_else(|| {
                center_crop(image.width, image.height, self.settings.aspect_ratio)
            });

            let image_url = self
                .cropper
                .crop_to_jpeg(image, rect, &request.correlation_id)
                .await?;
            let container_id = self
                .client
                .create_item_container(credential, &image_url, carousel, caption)
                .await?;
            debug!("Image {} -> container {}", image.id, container_id);

            containers.push(ContainerRecord {
                image_id: image.id.clone(),
                image_url,
                container_id,
                status: ContainerStatus::Pending,
            });
        }
        Ok(containers)
    }

    /// Check every pending container once, concurrently
    async fn check_containers(
        &self,
        credential: &Credential,
        mut containers: Vec<ContainerRecord>,
    ) -> Result<Checked> {
        let pending: Vec<usize> = containers
            .iter()
            .enumerate()
            .filter(|(_, c)| c.status == ContainerStatus::Pending)
            .map(|(i, _)| i)
            .collect();

        let statuses = join_all(pending.iter().map(|&i| {
            self.client
                .container_status(credential, &containers[i].container_id)
        }))
        .await;

        for (&i, status) in pending.iter().zip(statuses) {
            match status? {
                RemoteContainerStatus::Finished => containers[i].status = ContainerStatus::Ready,
                RemoteContainerStatus::InProgress => {}
                RemoteContainerStatus::Error(reason) => {
                    return Ok(Checked::Failed(format!(
                        "Instagram could not process image {}: {}",
                        containers[i].image_id, reason
                    )));
                }
            }
        }

        Ok(Checked::Polled(containers))
    }

    /// Wrap, publish, and record a fully processed post
    async fn assemble_and_publish(
        &self,
        credential: &Credential,
        correlation_id: &str,
        containers: &[ContainerRecord],
        caption: &str,
        carousel: bool,
    ) -> Result<PublishResult> {
        let target = if carousel {
            let children: Vec<String> = containers.iter().map(|c| c.container_id.clone()).collect();
            self.client
                .create_carousel_container(credential, &children, caption)
                .await?
        } else {
            containers
                .first()
                .map(|c| c.container_id.clone())
                .ok_or_else(|| GramcastError::InvalidInput("Job has no containers".to_string()))?
        };

        let media_id = self.client.publish(credential, &target).await?;

        let permalink = match self.client.permalink(credential, &media_id).await {
            Ok(link) => link,
            Err(e) => {
                warn!("Permalink lookup for {} failed: {}", media_id, e);
                None
            }
        };

        let shared_at = chrono::Utc::now().timestamp();
        let entries: Vec<SharedImage> = containers
            .iter()
            .map(|c| SharedImage {
                correlation_id: correlation_id.to_string(),
                image_id: c.image_id.clone(),
                media_id: media_id.clone(),
                permalink: permalink.clone(),
                shared_at,
            })
            .collect();
        if let Err(e) = self.ledger.record_shared_images(&entries).await {
            warn!("Failed to record shared images for {}: {}", correlation_id, e);
        }

        let result = PublishResult::published(media_id, permalink);
        info!("{}", result.message);
        Ok(result)
    }

    /// Store the job with a fresh ttl
    async fn renew(&self, job: &mut PublishJob) -> Result<()> {
        job.expires_at = chrono::Utc::now().timestamp() + self.settings.job_ttl.as_secs() as i64;
        self.jobs.put(&job.key, job, self.settings.job_ttl).await
    }
}

enum Checked {
    Polled(Vec<ContainerRecord>),
    Failed(String),
}

/// Mark containers ready where a poll found them ready, returning whether
/// anything changed
fn merge_ready(stored: &mut [ContainerRecord], polled: &[ContainerRecord]) -> bool {
    let mut advanced = false;
    for container in stored.iter_mut() {
        let now_ready = polled
            .iter()
            .any(|p| p.container_id == container.container_id && p.status == ContainerStatus::Ready);
        if now_ready && container.status == ContainerStatus::Pending {
            container.status = ContainerStatus::Ready;
            advanced = true;
        }
    }
    advanced
}

fn published_outcome(job: &PublishJob) -> Outcome {
    match &job.result {
        Some(result) => Outcome::Completed(result.clone()),
        None => Outcome::Failed(format!("Job {} was published but has no result", job.key)),
    }
}

/// Time left before the job's current expiry, at least one second
fn remaining_ttl(job: &PublishJob) -> Duration {
    let left = job.expires_at - chrono::Utc::now().timestamp();
    Duration::from_secs(left.max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::crop::mock::MockCropper;
    use crate::graph::mock::MockPublishClient;
    use crate::jobs::MemoryJobStore;
    use crate::types::{CropRect, ImageSource};
    use tempfile::TempDir;

    struct Harness {
        publisher: Publisher,
        client: MockPublishClient,
        cropper: MockCropper,
        _temp_dir: TempDir,
    }

    async fn harness(credentials: StaticCredentials) -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(db_path.to_str().unwrap()).await.unwrap();
        let client = MockPublishClient::new();
        let cropper = MockCropper::new();

        let publisher = Publisher::new(
            Arc::new(client.clone()),
            Arc::new(credentials),
            Arc::new(cropper.clone()),
            Arc::new(MemoryJobStore::new()),
            db,
            PublishSettings::default(),
        );

        Harness {
            publisher,
            client,
            cropper,
            _temp_dir: temp_dir,
        }
    }

    fn valid_credentials() -> StaticCredentials {
        StaticCredentials::new(Credential::new("token", "acct"), None)
    }

    fn image(id: &str, width: u32, height: u32) -> ImageSource {
        ImageSource {
            id: id.to_string(),
            reference: format!("/photos/{}.jpg", id),
            width,
            height,
        }
    }

    fn request(images: Vec<ImageSource>) -> PublishRequest {
        PublishRequest::new(images, "Caption".to_string(), "post-1".to_string())
    }

    #[tokio::test]
    async fn test_missing_credential_fails_without_remote_calls() {
        let h = harness(StaticCredentials::empty()).await;

        let outcome = h.publisher.start(&request(vec![image("a", 10, 10)])).await;
        assert!(matches!(outcome, Outcome::Failed(msg) if msg.contains("No Instagram account")));
        assert_eq!(h.client.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_expired_credential_fails() {
        let expired = StaticCredentials::new(
            Credential::new("token", "acct"),
            Some(chrono::Utc::now().timestamp() - 1),
        );
        let h = harness(expired).await;

        let outcome = h.publisher.start(&request(vec![image("a", 10, 10)])).await;
        assert!(matches!(outcome, Outcome::Failed(msg) if msg.contains("expired")));
    }

    #[tokio::test]
    async fn test_empty_request_fails() {
        let h = harness(valid_credentials()).await;
        let outcome = h.publisher.start(&request(vec![])).await;
        assert!(matches!(outcome, Outcome::Failed(msg) if msg.contains("At least one image")));
    }

    #[tokio::test]
    async fn test_too_many_images_fails() {
        let h = harness(valid_credentials()).await;
        let images = (0..11).map(|i| image(&i.to_string(), 10, 10)).collect();

        let outcome = h.publisher.start(&request(images)).await;
        assert!(matches!(outcome, Outcome::Failed(msg) if msg.contains("at most 10")));
        assert_eq!(h.client.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_long_caption_fails() {
        let h = harness(valid_credentials()).await;
        let mut req = request(vec![image("a", 10, 10)]);
        req.caption = "x".repeat(MAX_CAPTION_CHARS + 1);

        assert!(matches!(h.publisher.start(&req).await, Outcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_out_of_bounds_crop_fails_before_cropping() {
        let h = harness(valid_credentials()).await;
        let mut req = request(vec![image("a", 100, 100)]);
        req.crops = vec![Some(CropRect {
            x: 50.0,
            y: 0.0,
            width: 100.0,
            height: 100.0,
        })];

        let outcome = h.publisher.start(&req).await;
        assert!(matches!(outcome, Outcome::Failed(msg) if msg.contains("Image a")));
        assert!(h.cropper.calls().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_crop_is_centered() {
        let h = harness(valid_credentials()).await;

        let outcome = h.publisher.start(&request(vec![image("wide", 1000, 500)])).await;
        assert!(matches!(outcome, Outcome::Completed(_)));

        let calls = h.cropper.calls();
        assert_eq!(
            calls[0].1,
            CropRect {
                x: 250.0,
                y: 0.0,
                width: 500.0,
                height: 500.0
            }
        );
    }

    #[tokio::test]
    async fn test_crop_failure_is_failed_outcome() {
        let h = harness(valid_credentials()).await;
        h.cropper.mark_failing("a");

        let outcome = h.publisher.start(&request(vec![image("a", 10, 10)])).await;
        assert!(matches!(outcome, Outcome::Failed(msg) if msg.contains("Failed to crop")));
        assert!(h.client.item_calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let h = harness(valid_credentials()).await;
        assert_eq!(
            h.publisher.continue_job("gram_job_unknown").await,
            Outcome::NotFound
        );
    }

    #[test]
    fn test_settings_from_config() {
        let config = PublishingConfig {
            job_ttl_secs: 60,
            lease_stale_secs: 30,
            aspect_ratio: 0.8,
            request_timeout_secs: 20,
        };
        let settings = PublishSettings::from(&config);
        assert_eq!(settings.job_ttl, Duration::from_secs(60));
        assert_eq!(settings.lease_stale_secs, 30);
        assert_eq!(settings.aspect_ratio, 0.8);
    }
}
