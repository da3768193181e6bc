//! Request payload decoding
//!
//! Image and mask fields accept three encodings:
//! - `http://` / `https://` URL, fetched over HTTP
//! - a path to an existing local file
//! - base64 (optionally behind a `data:image/png;base64,` header)

use base64::Engine;
use image::{imageops::FilterType, GrayImage, RgbImage};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::error::{InpaintError, Result};

/// Where the bytes of an image field come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Url(String),
    File(PathBuf),
    Base64(String),
}

impl ImageSource {
    pub fn parse(data: &str) -> Self {
        if data.starts_with("http://") || data.starts_with("https://") {
            return ImageSource::Url(data.to_string());
        }

        // Only probe the filesystem for short strings; base64 payloads are huge
        if data.len() < 4096 {
            let path = PathBuf::from(data);
            if path.is_file() {
                return ImageSource::File(path);
            }
        }

        let payload = match data.split_once(',') {
            Some((_, rest)) => rest,
            None => data,
        };
        ImageSource::Base64(payload.to_string())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ImageSource::Url(_) => "url",
            ImageSource::File(_) => "file",
            ImageSource::Base64(_) => "base64",
        }
    }
}

/// Fetches raw bytes for image fields
#[derive(Clone)]
pub struct SourceLoader {
    client: reqwest::Client,
}

impl SourceLoader {
    pub fn new(fetch_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| InpaintError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub async fn load_bytes(&self, source: &ImageSource) -> Result<Vec<u8>> {
        match source {
            ImageSource::Url(url) => {
                debug!(url = %url, "Fetching image over HTTP");
                let response = self.client.get(url).send().await?;
                if !response.status().is_success() {
                    return Err(InpaintError::Fetch(format!(
                        "GET {} returned {}",
                        url,
                        response.status()
                    )));
                }
                Ok(response.bytes().await?.to_vec())
            }
            ImageSource::File(path) => tokio::fs::read(path).await.map_err(|e| {
                InpaintError::InvalidInput(format!("Failed to read {}: {}", path.display(), e))
            }),
            ImageSource::Base64(payload) => decode_base64(payload),
        }
    }
}

/// Decode standard-alphabet base64; characters outside the alphabet are discarded.
pub fn decode_base64(payload: &str) -> Result<Vec<u8>> {
    let cleaned: String = payload
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
        .collect();
    Ok(base64::engine::general_purpose::STANDARD.decode(cleaned)?)
}

/// Decode into 8-bit RGB; alpha is dropped and grayscale expanded.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    let img = image::load_from_memory(bytes)?;
    Ok(img.to_rgb8())
}

/// Decode into a single-channel mask, resized to `target` with
/// nearest-neighbour when the sizes disagree.
pub fn decode_mask(bytes: &[u8], target: (u32, u32)) -> Result<GrayImage> {
    let mask = image::load_from_memory(bytes)?.to_luma8();
    if mask.dimensions() == target {
        return Ok(mask);
    }
    debug!(
        from = ?mask.dimensions(),
        to = ?target,
        "Resizing mask to image size"
    );
    Ok(image::imageops::resize(
        &mask,
        target.0,
        target.1,
        FilterType::Nearest,
    ))
}
