//! Image intake - gets a photo reference from the device picker and checks it
//! before it is attached to a marker

use async_trait::async_trait;
use chrono::Utc;

use crate::marker::NewImage;
use crate::{Cause, Error, Result};

/// Largest image accepted by default (5 MiB)
pub const MAX_IMAGE_BYTES: u64 = 5 * 1024 * 1024;

/// What the device picker hands back
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PickedImage {
    pub uri: String,
    pub display_name: Option<String>,
    pub byte_size: Option<u64>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PickOutcome {
    Picked(PickedImage),
    Cancelled,
}

/// Device photo picker (external collaborator)
#[async_trait]
pub trait ImagePicker: Send + Sync {
    /// Ask for media-library access. `false` means the user refused.
    async fn request_permission(&self) -> bool;

    async fn pick(&self) -> anyhow::Result<PickOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageIntake {
    max_size_bytes: u64,
}

impl Default for ImageIntake {
    fn default() -> Self {
        Self::new(MAX_IMAGE_BYTES)
    }
}

impl ImageIntake {
    pub fn new(max_size_bytes: u64) -> Self {
        Self { max_size_bytes }
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    /// A picked image needs a URI and must not exceed the size limit.
    /// An unknown size is accepted.
    pub fn validate(&self, picked: &PickedImage) -> Result<()> {
        if picked.uri.trim().is_empty() {
            return Err(Error::ImagePickFailed(Cause::Message("Image has no URI".to_string())));
        }
        if let Some(size) = picked.byte_size {
            if size > self.max_size_bytes {
                return Err(Error::ImagePickFailed(Cause::Message(format!(
                    "Image is {} bytes, limit is {}",
                    size, self.max_size_bytes
                ))));
            }
        }
        Ok(())
    }

    /// Validate and convert to an attachable image
    pub fn prepare(&self, picked: PickedImage) -> Result<NewImage> {
        self.validate(&picked)?;

        let now = Utc::now();
        let name = picked
            .display_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("Image_{}", now.timestamp_millis()));

        let mut image = NewImage::new(picked.uri, name).added_at(now);
        image.size = picked.byte_size;
        image.mime_type = picked.mime_type;
        Ok(image)
    }

    /// Run the picker flow: permission, pick, validate.
    /// `Ok(None)` means the user cancelled.
    pub async fn acquire(&self, picker: &dyn ImagePicker) -> Result<Option<NewImage>> {
        if !picker.request_permission().await {
            tracing::warn!("Media library permission denied");
            return Err(Error::PermissionDenied);
        }

        match picker.pick().await {
            Ok(PickOutcome::Cancelled) => {
                tracing::debug!("Image pick cancelled");
                Ok(None)
            }
            Ok(PickOutcome::Picked(picked)) => self.prepare(picked).map(Some),
            Err(e) => {
                tracing::error!("Image picker failed: {:#}", e);
                Err(Error::ImagePickFailed(Cause::Message(e.to_string())))
            }
        }
    }
}
