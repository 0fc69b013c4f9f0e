//! Image cropping for Instagram uploads
//!
//! Instagram fetches every image from a public URL, so each source image is
//! cropped to its rectangle, encoded as JPEG and made reachable over HTTP
//! before a container can be created for it. [`ImageCropper`] hides how that
//! happens; [`jpeg::JpegCropper`] does it with the `image` crate and a
//! directory served by a web server.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use crate::error::{GramcastError, Result};
use crate::types::{CropRect, ImageSource};

pub mod jpeg;
pub mod mock;

/// Rounding slack allowed when checking a crop against image bounds
const BOUNDS_TOLERANCE: f64 = 0.5;

#[async_trait]
pub trait ImageCropper: Send + Sync {
    /// Whether the source can be read
    async fn source_exists(&self, source: &ImageSource) -> bool;

    /// Crop `source` to `rect`, encode as JPEG, and return its public URL
    async fn crop_to_jpeg(
        &self,
        source: &ImageSource,
        rect: CropRect,
        correlation_id: &str,
    ) -> Result<String>;
}

/// Largest rectangle of aspect ratio `aspect` (width / height) centered in a
/// `width` x `height` image
pub fn center_crop(width: u32, height: u32, aspect: f64) -> CropRect {
    let w = f64::from(width);
    let h = f64::from(height);

    if w / h > aspect {
        let crop_width = h * aspect;
        CropRect {
            x: (w - crop_width) / 2.0,
            y: 0.0,
            width: crop_width,
            height: h,
        }
    } else {
        let crop_height = w / aspect;
        CropRect {
            x: 0.0,
            y: (h - crop_height) / 2.0,
            width: w,
            height: crop_height,
        }
    }
}

/// Check that `rect` has positive size and lies within the image
pub fn validate_crop(rect: &CropRect, width: u32, height: u32) -> std::result::Result<(), String> {
    let values = [rect.x, rect.y, rect.width, rect.height];
    if values.iter().any(|v| !v.is_finite()) {
        return Err("crop rectangle contains a non-numeric value".to_string());
    }
    if rect.width <= 0.0 || rect.height <= 0.0 {
        return Err(format!(
            "crop rectangle {}x{} has no area",
            rect.width, rect.height
        ));
    }
    if rect.x < 0.0 || rect.y < 0.0 {
        return Err(format!(
            "crop origin ({}, {}) is outside the image",
            rect.x, rect.y
        ));
    }
    if rect.x + rect.width > f64::from(width) + BOUNDS_TOLERANCE
        || rect.y + rect.height > f64::from(height) + BOUNDS_TOLERANCE
    {
        return Err(format!(
            "crop rectangle extends past the {}x{} image",
            width, height
        ));
    }
    Ok(())
}

/// Delete regular files in `dir` last modified more than `max_age` ago
///
/// Returns the number of files removed. A missing directory is not an error.
pub fn cleanup_temp_dir(dir: &Path, max_age: Duration) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let entries = std::fs::read_dir(dir).map_err(|e| {
        GramcastError::Media(format!("Failed to read {}: {}", dir.display(), e))
    })?;
    let mut removed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok());

        if matches!(age, Some(age) if age > max_age) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }

    if removed > 0 {
        tracing::info!("Removed {} expired files from {}", removed, dir.display());
    }
    Ok(removed)
}
