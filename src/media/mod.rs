//! Media acquisition
//!
//! [`ImageDownloader`] fetches the image a feed item references and stores
//! it under the media output directory, where the supervisor's cleanup loop
//! expires it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::pipeline::CandidateItem;
use crate::supervisor::SessionHandle;
use crate::utils::error::FetchError;
use crate::utils::sha256_hex;

/// Smallest accepted image
pub const MIN_IMAGE_BYTES: u64 = 1024;

/// Largest accepted image
pub const MAX_IMAGE_BYTES: u64 = 5 * 1024 * 1024;

/// What the orchestrator does when no image is available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaPolicy {
    /// Skip the item without an image
    Required,
    /// Publish text only when no image is available
    #[default]
    BestEffort,
    /// Never fetch images
    Disabled,
}

impl FromStr for MediaPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "required" => Ok(Self::Required),
            "best_effort" | "best-effort" | "optional" => Ok(Self::BestEffort),
            "disabled" | "none" | "off" => Ok(Self::Disabled),
            other => Err(format!("unknown media policy '{other}'")),
        }
    }
}

/// Produces a local image file for an item
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// `Ok(None)` means the item has no usable image
    async fn acquire_image(
        &self,
        item: &CandidateItem,
        fingerprint: &str,
    ) -> Result<Option<PathBuf>, FetchError>;
}

/// Downloads feed images over the shared session
#[derive(Debug, Clone)]
pub struct ImageDownloader {
    session: Arc<SessionHandle>,
    output_dir: PathBuf,
    timeout: Duration,
}

impl ImageDownloader {
    pub fn new(session: Arc<SessionHandle>, output_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            session,
            output_dir: output_dir.into(),
            timeout,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

/// Resolve an image reference against the item link
///
/// Protocol-relative URLs get `https:`; relative paths are joined onto the
/// item link.
pub fn resolve_image_url(image: &str, base: &str) -> Result<Url, FetchError> {
    let image = image.trim();
    if image.is_empty() {
        return Err(FetchError::InvalidUrl("empty image URL".to_string()));
    }
    if let Some(rest) = image.strip_prefix("//") {
        return Url::parse(&format!("https://{rest}"))
            .map_err(|e| FetchError::InvalidUrl(format!("{image}: {e}")));
    }

    match Url::parse(image) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(base)
            .and_then(|b| b.join(image))
            .map_err(|e| FetchError::InvalidUrl(format!("{image}: {e}"))),
        Err(e) => Err(FetchError::InvalidUrl(format!("{image}: {e}"))),
    }
}

fn extension_for(content_type: &str) -> Option<&'static str> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        _ => None,
    }
}

/// Local file name for a downloaded image
pub fn image_file_name(fingerprint: &str, url: &str, ext: &str) -> String {
    let prefix: String = fingerprint.chars().take(16).collect();
    let url_hash = sha256_hex(&[url.as_bytes()]);
    format!("{prefix}_{}.{ext}", &url_hash[..8])
}

#[async_trait]
impl MediaSource for ImageDownloader {
    async fn acquire_image(
        &self,
        item: &CandidateItem,
        fingerprint: &str,
    ) -> Result<Option<PathBuf>, FetchError> {
        let Some(raw) = item.image_url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };
        let url = resolve_image_url(raw, &item.link)?;

        let lease = self.session.acquire().await?;
        let response = match lease.client.get(url.clone()).timeout(self.timeout).send().await {
            Ok(response) => response,
            Err(e) => {
                let err = FetchError::from_request(e);
                if err.is_connection_failure() {
                    self.session.invalidate(lease.generation).await;
                }
                return Err(err);
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let Some(ext) = extension_for(&content_type) else {
            return Err(FetchError::Rejected(format!("content type {content_type:?}")));
        };

        if let Some(length) = response.content_length() {
            if !(MIN_IMAGE_BYTES..=MAX_IMAGE_BYTES).contains(&length) {
                return Err(FetchError::Rejected(format!("declared size {length} bytes")));
            }
        }

        let bytes = response.bytes().await.map_err(FetchError::from_request)?;
        let size = bytes.len() as u64;
        if !(MIN_IMAGE_BYTES..=MAX_IMAGE_BYTES).contains(&size) {
            return Err(FetchError::Rejected(format!("size {size} bytes")));
        }

        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self
            .output_dir
            .join(image_file_name(fingerprint, url.as_str(), ext));
        tokio::fs::write(&path, &bytes).await?;

        tracing::debug!(url = %url, path = %path.display(), bytes = size, "Image downloaded");
        Ok(Some(path))
    }
}
