//! Fetch a source image and re-encode it to the catalog thumbnail format.
//!
//! Decoding sniffs the bytes, so the declared content type is only used to reject
//! responses that are plainly not images. The result is always a JPEG of exactly
//! `width` x `height`; aspect ratio is not preserved.

use crate::error::TransformError;
use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, ImageOutputFormat};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::io::Cursor;
use std::time::Duration;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct TransformConfig {
    pub width: u32,
    pub height: u32,
    /// JPEG quality (0-100)
    pub quality: u8,
    pub fetch_timeout: Duration,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            width: 300,
            height: 300,
            quality: 80,
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

pub struct ImageTransformer {
    client: Client,
    config: TransformConfig,
}

impl ImageTransformer {
    pub fn new(config: TransformConfig) -> Result<Self, TransformError> {
        let client = Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .map_err(|e| TransformError::Fetch(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    /// GET the source url, returning the body and its declared content type.
    pub async fn fetch(&self, url: &str) -> Result<(Bytes, Option<String>), TransformError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| TransformError::Fetch(e.to_string()))?;

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let body = resp
            .bytes()
            .await
            .map_err(|e| TransformError::Fetch(e.to_string()))?;

        debug!(url, size = body.len(), content_type = ?content_type, "Fetched source image");
        Ok((body, content_type))
    }

    /// Fetch then transform, with the CPU-bound part moved off the async runtime.
    pub async fn fetch_and_transform(&self, url: &str) -> Result<Vec<u8>, TransformError> {
        let (raw, content_type) = self.fetch(url).await?;
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || transform(&raw, content_type.as_deref(), &config))
            .await
            .map_err(|e| TransformError::Encode(format!("transform task panicked: {e}")))?
    }
}

pub fn transform(
    raw: &[u8],
    content_type: Option<&str>,
    config: &TransformConfig,
) -> Result<Vec<u8>, TransformError> {
    if let Some(content_type) = content_type {
        if !content_type.trim_start().to_ascii_lowercase().starts_with("image/") {
            return Err(TransformError::UnsupportedFormat(format!(
                "content type {content_type} is not an image"
            )));
        }
    }

    let img = image::load_from_memory(raw)
        .map_err(|e| TransformError::UnsupportedFormat(e.to_string()))?;

    let resized = img.resize_exact(config.width, config.height, FilterType::Lanczos3);
    // JPEG has no alpha channel.
    let resized = DynamicImage::ImageRgb8(resized.to_rgb8());

    let mut buf = Vec::new();
    resized
        .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Jpeg(config.quality))
        .map_err(|e| TransformError::Encode(e.to_string()))?;

    Ok(buf)
}
