//! In-memory cropper that records requests

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::crop::ImageCropper;
use crate::error::{GramcastError, Result};
use crate::types::{CropRect, ImageSource};

/// Returns `https://media.test/{image id}.jpg` for every crop
#[derive(Clone, Default)]
pub struct MockCropper {
    missing: Arc<Mutex<HashSet<String>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    calls: Arc<Mutex<Vec<(String, CropRect)>>>,
}

impl MockCropper {
    pub fn new() -> Self {
        Self::default()
    }

    /// URL produced for an image id
    pub fn url_for(image_id: &str) -> String {
        format!("https://media.test/{}.jpg", image_id)
    }

    /// Report the image as nonexistent
    pub fn mark_missing(&self, image_id: &str) {
        self.missing.lock().unwrap().insert(image_id.to_string());
    }

    /// Fail cropping for the image
    pub fn mark_failing(&self, image_id: &str) {
        self.failing.lock().unwrap().insert(image_id.to_string());
    }

    /// Every (image id, rect) cropped so far
    pub fn calls(&self) -> Vec<(String, CropRect)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageCropper for MockCropper {
    async fn source_exists(&self, source: &ImageSource) -> bool {
        !self.missing.lock().unwrap().contains(&source.id)
    }

    async fn crop_to_jpeg(
        &self,
        source: &ImageSource,
        rect: CropRect,
        _correlation_id: &str,
    ) -> Result<String> {
        self.calls.lock().unwrap().push((source.id.clone(), rect));

        if self.failing.lock().unwrap().contains(&source.id) {
            return Err(GramcastError::Media(format!(
                "Failed to crop image {}",
                source.id
            )));
        }
        Ok(Self::url_for(&source.id))
    }
}
