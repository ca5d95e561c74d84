use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Placeholder substituted with the uploaded image's file name.
pub const IMAGE_NAME_TOKEN: &str = "IMAGE_NAME";
pub const DEFAULT_IMAGE_PATH: &str = "assets/img";
pub const DEFAULT_SHORTCODE_TEMPLATE: &str = "{{< img src=\"/img/IMAGE_NAME\" >}}";

static DATA_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^data:([A-Za-z0-9.+-]+/[A-Za-z0-9.+-]+);base64,([A-Za-z0-9+/]*={0,2})$")
        .expect("valid data URL pattern")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PostError {
    #[error("image data and image name must be provided together")]
    ImagePairing,
    #[error("image data is not a base64 data URL")]
    InvalidImageData,
    #[error("image name must be non-empty")]
    EmptyImageName,
}

/// Inline image payload: a `data:<mime>;base64,<bytes>` string plus the original file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    data: String,
    name: String,
}

impl ImageAttachment {
    pub fn new(data: impl Into<String>, name: impl Into<String>) -> Result<Self, PostError> {
        let data = data.into();
        let name = name.into();
        if name.trim().is_empty() {
            return Err(PostError::EmptyImageName);
        }
        if !DATA_URL.is_match(&data) {
            return Err(PostError::InvalidImageData);
        }
        Ok(Self { data, name })
    }

    pub fn from_bytes(mime: &str, bytes: &[u8], name: impl Into<String>) -> Result<Self, PostError> {
        let data = format!("data:{};base64,{}", mime, STANDARD.encode(bytes));
        Self::new(data, name)
    }

    /// Read an image from disk, inferring the MIME type from its extension.
    pub async fn from_file(path: &Path) -> anyhow::Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("image.jpg")
            .to_string();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read image: {}", path.display()))?;
        Ok(Self::from_bytes(mime_for_path(path), &bytes, name)?)
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime_type(&self) -> &str {
        DATA_URL
            .captures(&self.data)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .unwrap_or("application/octet-stream")
    }
}

pub fn mime_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_ascii_lowercase())
    {
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "gif" => "image/gif",
        Some(ext) if ext == "webp" => "image/webp",
        Some(ext) if ext == "svg" => "image/svg+xml",
        _ => "image/jpeg",
    }
}

/// A note ready to be published but not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
///
/// Fields are only set through the builder methods, so `image_path` and
/// `shortcode_template` are never blank.
pub struct PostDraft {
    title: Option<String>,
    content: String,
    tags: Vec<String>,
    image: Option<ImageAttachment>,
    image_path: String,
    shortcode_template: String,
}

impl PostDraft {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            title: None,
            content: content.into(),
            tags: Vec::new(),
            image: None,
            image_path: DEFAULT_IMAGE_PATH.to_string(),
            shortcode_template: DEFAULT_SHORTCODE_TEMPLATE.to_string(),
        }
    }

    /// Blank titles are treated as absent.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        let title = title.into();
        self.title = if title.trim().is_empty() {
            None
        } else {
            Some(title)
        };
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_image(mut self, image: ImageAttachment) -> Self {
        self.image = Some(image);
        self
    }

    /// Attach an image from its loose parts; data without a name (or the reverse) is rejected.
    pub fn with_image_parts(
        mut self,
        data: Option<String>,
        name: Option<String>,
    ) -> Result<Self, PostError> {
        self.image = match (data, name) {
            (Some(data), Some(name)) => Some(ImageAttachment::new(data, name)?),
            (None, None) => None,
            _ => return Err(PostError::ImagePairing),
        };
        Ok(self)
    }

    /// Blank paths fall back to [`DEFAULT_IMAGE_PATH`].
    pub fn with_image_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.image_path = if path.trim().is_empty() {
            DEFAULT_IMAGE_PATH.to_string()
        } else {
            path.trim().to_string()
        };
        self
    }

    pub fn with_shortcode_template(mut self, template: impl Into<String>) -> Self {
        let template = template.into();
        if !template.trim().is_empty() {
            self.shortcode_template = template.trim().to_string();
        }
        self
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn image(&self) -> Option<&ImageAttachment> {
        self.image.as_ref()
    }

    pub fn image_path(&self) -> &str {
        &self.image_path
    }

    pub fn shortcode_template(&self) -> &str {
        &self.shortcode_template
    }

    pub fn image_data(&self) -> Option<&str> {
        self.image.as_ref().map(ImageAttachment::data)
    }

    pub fn image_name(&self) -> Option<&str> {
        self.image.as_ref().map(ImageAttachment::name)
    }

    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or("Untitled Post")
    }
}

/// A queued post awaiting publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPost {
    pub id: i64,
    pub post: PostDraft,
    pub enqueued_at: DateTime<Utc>,
    /// Set when part of the stored row (its image) could not be decoded; such a
    /// post must not be sent as-is.
    pub unreadable: Option<String>,
}

/// A post the endpoint rejected permanently, parked outside the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedPost {
    pub id: i64,
    pub post: PostDraft,
    pub enqueued_at: DateTime<Utc>,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Result of a single send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Success {
        message: String,
        published_path: Option<String>,
    },
    RetryableFailure {
        reason: String,
    },
    PermanentFailure {
        reason: String,
    },
}

impl SubmissionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SubmissionOutcome::Success { .. })
    }
}

/// Published post entry returned by the browse endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostItem {
    pub name: String,
    pub path: String,
    pub url: String,
}

/// Persisted backoff state of the sync driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySchedule {
    pub attempt: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_parts_must_be_paired() {
        let data = "data:image/png;base64,iVBORw0KGgo=".to_string();
        let err = PostDraft::new("body")
            .with_image_parts(Some(data.clone()), None)
            .unwrap_err();
        assert_eq!(err, PostError::ImagePairing);

        let err = PostDraft::new("body")
            .with_image_parts(None, Some("a.png".into()))
            .unwrap_err();
        assert_eq!(err, PostError::ImagePairing);

        let draft = PostDraft::new("body")
            .with_image_parts(Some(data), Some("a.png".into()))
            .unwrap();
        assert_eq!(draft.image_name(), Some("a.png"));
        assert_eq!(draft.image.unwrap().mime_type(), "image/png");

        let draft = PostDraft::new("body").with_image_parts(None, None).unwrap();
        assert!(draft.image.is_none());
    }

    #[test]
    fn rejects_non_data_url() {
        assert_eq!(
            ImageAttachment::new("http://example.com/a.png", "a.png").unwrap_err(),
            PostError::InvalidImageData
        );
        assert_eq!(
            ImageAttachment::new("data:image/png;base64,AAAA", " ").unwrap_err(),
            PostError::EmptyImageName
        );
    }

    #[test]
    fn from_bytes_encodes_standard_base64() {
        let img = ImageAttachment::from_bytes("image/jpeg", b"hello", "h.jpg").unwrap();
        assert_eq!(img.data(), "data:image/jpeg;base64,aGVsbG8=");
    }

    #[test]
    fn defaults_and_normalisation() {
        let draft = PostDraft::new("")
            .with_title("   ")
            .with_image_path("")
            .with_shortcode_template("");
        assert!(draft.title.is_none());
        assert_eq!(draft.image_path, DEFAULT_IMAGE_PATH);
        assert_eq!(draft.shortcode_template, DEFAULT_SHORTCODE_TEMPLATE);
        assert_eq!(draft.display_title(), "Untitled Post");
    }

    #[test]
    fn mime_falls_back_to_jpeg() {
        assert_eq!(mime_for_path(Path::new("a.PNG")), "image/png");
        assert_eq!(mime_for_path(Path::new("photo")), "image/jpeg");
    }
}
