//! Scriptable in-memory publish client
//!
//! Records every call so tests can assert exactly which remote operations a
//! workflow performed, and lets a test decide per image URL what container
//! status Instagram would report. Clones share state.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use crate::credentials::Credential;
use crate::error::{RemoteError, Result};
use crate::graph::{PublishClient, RefreshedToken, RemoteContainerStatus};

/// Arguments of one `create_item_container` call
#[derive(Debug, Clone, PartialEq)]
pub struct ItemCall {
    pub image_url: String,
    pub is_carousel_item: bool,
    pub caption: Option<String>,
}

/// Arguments of one `create_carousel_container` call
#[derive(Debug, Clone, PartialEq)]
pub struct CarouselCall {
    pub children: Vec<String>,
    pub caption: String,
}

#[derive(Debug, Default)]
struct MockState {
    next_container: usize,
    /// container id -> image url it was created for
    containers: HashMap<String, String>,
    /// image url -> status reported for its container
    statuses: HashMap<String, RemoteContainerStatus>,
    item_calls: Vec<ItemCall>,
    status_calls: Vec<String>,
    carousel_calls: Vec<CarouselCall>,
    publish_calls: Vec<String>,
    permalink_calls: Vec<String>,
    refresh_calls: usize,
}

/// Behavior knobs for [`MockPublishClient`]
#[derive(Debug, Clone)]
pub struct MockClientConfig {
    pub media_id: String,
    pub carousel_id: String,
    pub permalink: Option<String>,
    pub refreshed_token: String,
    /// Failure returned by `create_item_container`
    pub create_error: Option<RemoteError>,
    /// Failure returned by `publish`
    pub publish_error: Option<RemoteError>,
    /// Failure returned by `permalink`
    pub permalink_error: Option<RemoteError>,
    /// Latency added to carousel creation and publish
    pub delay: Duration,
}

impl Default for MockClientConfig {
    fn default() -> Self {
        Self {
            media_id: "M1".to_string(),
            carousel_id: "CAROUSEL1".to_string(),
            permalink: Some("https://www.instagram.com/p/M1/".to_string()),
            refreshed_token: "refreshed-token".to_string(),
            create_error: None,
            publish_error: None,
            permalink_error: None,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Clone, Default)]
pub struct MockPublishClient {
    config: MockClientConfig,
    state: Arc<Mutex<MockState>>,
}

impl MockPublishClient {
    /// A client whose containers are all immediately finished
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MockClientConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Report `status` for containers created from `image_url`
    ///
    /// Can be changed between calls to simulate processing finishing.
    pub fn set_status(&self, image_url: &str, status: RemoteContainerStatus) {
        self.state
            .lock()
            .unwrap()
            .statuses
            .insert(image_url.to_string(), status);
    }

    pub fn item_calls(&self) -> Vec<ItemCall> {
        self.state.lock().unwrap().item_calls.clone()
    }

    pub fn status_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().status_calls.clone()
    }

    pub fn carousel_calls(&self) -> Vec<CarouselCall> {
        self.state.lock().unwrap().carousel_calls.clone()
    }

    pub fn publish_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().publish_calls.clone()
    }

    pub fn permalink_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().permalink_calls.clone()
    }

    pub fn refresh_calls(&self) -> usize {
        self.state.lock().unwrap().refresh_calls
    }

    /// Total number of remote calls made so far
    pub fn total_calls(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.item_calls.len()
            + state.status_calls.len()
            + state.carousel_calls.len()
            + state.publish_calls.len()
            + state.permalink_calls.len()
            + state.refresh_calls
    }

    async fn simulate_latency(&self) {
        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }
    }
}

#[async_trait]
impl PublishClient for MockPublishClient {
    async fn create_item_container(
        &self,
        _credential: &Credential,
        image_url: &str,
        is_carousel_item: bool,
        caption: Option<&str>,
    ) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.item_calls.push(ItemCall {
            image_url: image_url.to_string(),
            is_carousel_item,
            caption: caption.map(str::to_string),
        });

        if let Some(err) = &self.config.create_error {
            return Err(err.clone().into());
        }

        state.next_container += 1;
        let id = format!("C{}", state.next_container);
        state.containers.insert(id.clone(), image_url.to_string());
        Ok(id)
    }

    async fn container_status(
        &self,
        _credential: &Credential,
        container_id: &str,
    ) -> Result<RemoteContainerStatus> {
        let mut state = self.state.lock().unwrap();
        state.status_calls.push(container_id.to_string());

        let url = state
            .containers
            .get(container_id)
            .cloned()
            .ok_or_else(|| RemoteError::Api {
                code: 100,
                message: format!("Unknown container {}", container_id),
            })?;

        Ok(state
            .statuses
            .get(&url)
            .cloned()
            .unwrap_or(RemoteContainerStatus::Finished))
    }

    async fn create_carousel_container(
        &self,
        _credential: &Credential,
        children: &[String],
        caption: &str,
    ) -> Result<String> {
        self.state.lock().unwrap().carousel_calls.push(CarouselCall {
            children: children.to_vec(),
            caption: caption.to_string(),
        });
        self.simulate_latency().await;

        Ok(self.config.carousel_id.clone())
    }

    async fn publish(&self, _credential: &Credential, container_id: &str) -> Result<String> {
        self.state
            .lock()
            .unwrap()
            .publish_calls
            .push(container_id.to_string());
        self.simulate_latency().await;

        match &self.config.publish_error {
            Some(err) => Err(err.clone().into()),
            None => Ok(self.config.media_id.clone()),
        }
    }

    async fn permalink(&self, _credential: &Credential, media_id: &str) -> Result<Option<String>> {
        self.state
            .lock()
            .unwrap()
            .permalink_calls
            .push(media_id.to_string());

        match &self.config.permalink_error {
            Some(err) => Err(err.clone().into()),
            None => Ok(self.config.permalink.clone()),
        }
    }

    async fn refresh_token(&self, _credential: &Credential) -> Result<RefreshedToken> {
        self.state.lock().unwrap().refresh_calls += 1;
        Ok(RefreshedToken {
            access_token: self.config.refreshed_token.clone(),
            expires_in: Some(60 * 24 * 60 * 60),
        })
    }
}
