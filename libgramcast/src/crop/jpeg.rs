//! JPEG cropper backed by the `image` crate

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::crop::ImageCropper;
use crate::error::{GramcastError, Result};
use crate::types::{CropRect, ImageSource};

const JPEG_QUALITY: u8 = 90;

fn is_remote(reference: &str) -> bool {
    reference.starts_with("https://") || reference.starts_with("http://")
}

/// Keep file names predictable and URL safe
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Writes cropped JPEGs to `temp_dir` and serves them from `public_base_url`
///
/// Sources that are already URLs are passed through untouched; they are
/// expected to have been cropped before upload.
#[derive(Debug, Clone)]
pub struct JpegCropper {
    temp_dir: PathBuf,
    public_base_url: String,
}

impl JpegCropper {
    pub fn new(temp_dir: PathBuf, public_base_url: &str) -> Self {
        Self {
            temp_dir,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Read the pixel dimensions of a local image without decoding it fully
    pub fn probe(path: &Path) -> Result<(u32, u32)> {
        image::image_dimensions(path).map_err(|e| {
            GramcastError::Media(format!("Failed to read {}: {}", path.display(), e))
        })
    }

    fn crop_file(source: &Path, rect: CropRect, target: &Path) -> Result<()> {
        let img = image::open(source).map_err(|e| {
            GramcastError::Media(format!("Failed to open {}: {}", source.display(), e))
        })?;

        let x = rect.x.max(0.0).floor() as u32;
        let y = rect.y.max(0.0).floor() as u32;
        let width = (rect.width.round() as u32).min(img.width().saturating_sub(x));
        let height = (rect.height.round() as u32).min(img.height().saturating_sub(y));
        if width == 0 || height == 0 {
            return Err(GramcastError::Media(format!(
                "Crop of {} is empty after rounding",
                source.display()
            )));
        }

        let cropped = img.crop_imm(x, y, width, height).to_rgb8();

        let file = File::create(target).map_err(|e| {
            GramcastError::Media(format!("Failed to create {}: {}", target.display(), e))
        })?;
        let encoder = JpegEncoder::new_with_quality(BufWriter::new(file), JPEG_QUALITY);
        cropped.write_with_encoder(encoder).map_err(|e| {
            GramcastError::Media(format!("Failed to encode {}: {}", target.display(), e))
        })?;

        Ok(())
    }
}

#[async_trait]
impl ImageCropper for JpegCropper {
    async fn source_exists(&self, source: &ImageSource) -> bool {
        is_remote(&source.reference) || crate::config::expand_path(&source.reference).is_file()
    }

    async fn crop_to_jpeg(
        &self,
        source: &ImageSource,
        rect: CropRect,
        correlation_id: &str,
    ) -> Result<String> {
        if is_remote(&source.reference) {
            return Ok(source.reference.clone());
        }

        if self.public_base_url.is_empty() {
            return Err(GramcastError::Media(
                "media.public_base_url is not configured; Instagram cannot fetch local images"
                    .to_string(),
            ));
        }

        std::fs::create_dir_all(&self.temp_dir).map_err(|e| {
            GramcastError::Media(format!(
                "Failed to create {}: {}",
                self.temp_dir.display(),
                e
            ))
        })?;

        let file_name = format!(
            "crop-{}-{}.jpg",
            sanitize(correlation_id),
            uuid::Uuid::new_v4().simple()
        );
        let source_path = crate::config::expand_path(&source.reference);
        let target = self.temp_dir.join(&file_name);

        let target_for_task = target.clone();
        tokio::task::spawn_blocking(move || Self::crop_file(&source_path, rect, &target_for_task))
            .await
            .map_err(|e| GramcastError::Media(format!("Crop task failed: {}", e)))??;

        tracing::debug!("Cropped {} to {}", source.id, target.display());
        Ok(format!("{}/{}", self.public_base_url, file_name))
    }
}
