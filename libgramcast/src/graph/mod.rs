//! Instagram Graph API publishing client
//!
//! Publishing an image post to Instagram is a multi-step remote process: each
//! image becomes an item container, containers are processed asynchronously on
//! Instagram's side, multi-image posts wrap their items in a carousel
//! container, and the final container is published to produce a media object.
//!
//! [`PublishClient`] exposes those steps one call at a time and never waits on
//! remote processing itself. Orchestration lives in [`crate::publisher`].
//!
//! # Examples
//!
//! ```no_run
//! use libgramcast::credentials::Credential;
//! use libgramcast::graph::{instagram::InstagramClient, PublishClient, RemoteContainerStatus};
//! use std::time::Duration;
//!
//! # async fn example() -> libgramcast::error::Result<()> {
//! let client = InstagramClient::new("https://graph.instagram.com", Duration::from_secs(20))?;
//! let credential = Credential::new("IGQ...", "17841400000000000");
//!
//! let container = client
//!     .create_item_container(&credential, "https://example.com/a.jpg", false, Some("Hello"))
//!     .await?;
//!
//! if client.container_status(&credential, &container).await? == RemoteContainerStatus::Finished {
//!     let media_id = client.publish(&credential, &container).await?;
//!     println!("Published {}", media_id);
//! }
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;

use crate::credentials::Credential;
use crate::error::Result;

pub mod instagram;

// Available outside tests so integration tests and dry runs can use it
pub mod mock;

/// Processing state of a remote container as reported by Instagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteContainerStatus {
    /// Still being fetched or processed (`IN_PROGRESS`, or any unknown code)
    InProgress,
    /// Ready to be published or used as a carousel child (`FINISHED`)
    Finished,
    /// Processing failed or the container expired (`ERROR`, `EXPIRED`)
    Error(String),
}

impl RemoteContainerStatus {
    /// Interpret a Graph API `status_code` value
    pub fn from_status_code(code: &str) -> Self {
        match code {
            "FINISHED" => Self::Finished,
            "ERROR" | "EXPIRED" => Self::Error(format!("Container status {}", code)),
            _ => Self::InProgress,
        }
    }
}

/// A freshly issued long-lived token
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Seconds until the new token expires, when Instagram reports it
    pub expires_in: Option<i64>,
}

/// Remote operations needed to publish a post
///
/// Every call is a single request with no retry. Callers decide what a
/// failure means for the surrounding workflow.
#[async_trait]
pub trait PublishClient: Send + Sync {
    /// Create an item container for one image
    ///
    /// `caption` is only sent for single-image posts; carousel items carry no
    /// caption of their own.
    async fn create_item_container(
        &self,
        credential: &Credential,
        image_url: &str,
        is_carousel_item: bool,
        caption: Option<&str>,
    ) -> Result<String>;

    /// Check a container's processing state once
    async fn container_status(
        &self,
        credential: &Credential,
        container_id: &str,
    ) -> Result<RemoteContainerStatus>;

    /// Create a carousel container over ready item containers
    async fn create_carousel_container(
        &self,
        credential: &Credential,
        children: &[String],
        caption: &str,
    ) -> Result<String>;

    /// Publish a ready container, returning the new media id
    async fn publish(&self, credential: &Credential, container_id: &str) -> Result<String>;

    /// Look up the public permalink of a published media object
    async fn permalink(&self, credential: &Credential, media_id: &str) -> Result<Option<String>>;

    /// Exchange a long-lived token for a fresh one
    async fn refresh_token(&self, credential: &Credential) -> Result<RefreshedToken>;
}
