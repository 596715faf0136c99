//! # Maplab - marker persistence and state synchronization
//!
//! Users drop markers on a map and attach photos to them. This crate is the
//! part that keeps those markers safe:
//! - SQLite-backed `Store` with versioned migrations and retried transactions
//! - `MarkerRepository`, the only component that speaks SQL
//! - `MarkerCache`, the observable in-memory snapshot every screen reads
//! - `ImageIntake`, validation of picked photos before they are attached
//! - `ProximityTracker`, "you are near a marker" detection over the snapshot

pub mod cache;
pub mod config;
pub mod intake;
pub mod marker;
pub mod proximity;
pub mod repository;
pub mod storage;
pub mod ui;

use std::sync::Arc;

// Re-exports for convenient access
pub use cache::{MarkerCache, MarkersState};
pub use intake::{ImageIntake, ImagePicker, PickOutcome, PickedImage};
pub use marker::{Coordinate, Image, Marker, MarkerUpdate, NewImage, NewMarker};
pub use repository::{DbStats, MarkerRepo, MarkerRepository};
pub use storage::{Store, StoreConfig, StoreError};

/// Result type alias for Maplab domain operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why a domain operation failed: a storage error or a plain message (rejected input, picker failure)
#[derive(Debug, Clone, thiserror::Error)]
pub enum Cause {
    #[error(transparent)]
    Store(Arc<StoreError>),

    #[error("{0}")]
    Message(String),
}

impl From<StoreError> for Cause {
    fn from(err: StoreError) -> Self {
        Cause::Store(Arc::new(err))
    }
}

/// Error types for domain operations. Cloneable so it can live in a published snapshot.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Marker not found: {0}")]
    MarkerNotFound(String),

    #[error("Failed to add marker: {0}")]
    MarkerAddFailed(#[source] Cause),

    #[error("Failed to update marker: {0}")]
    MarkerUpdateFailed(#[source] Cause),

    #[error("Failed to delete marker: {0}")]
    MarkerDeleteFailed(#[source] Cause),

    #[error("Failed to load markers: {0}")]
    MarkerLoadFailed(#[source] Cause),

    #[error("Media library permission denied")]
    PermissionDenied,

    #[error("Failed to pick image: {0}")]
    ImagePickFailed(#[source] Cause),

    #[error("Failed to save image: {0}")]
    ImageAttachFailed(#[source] Cause),

    #[error("Failed to delete image: {0}")]
    ImageDeleteFailed(#[source] Cause),
}

/// Type tag of an [`Error`], for UIs that style banners per category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MarkerNotFound,
    MarkerAddFailed,
    MarkerUpdateFailed,
    MarkerDeleteFailed,
    MarkerLoadFailed,
    PermissionDenied,
    ImagePickFailed,
    ImageAttachFailed,
    ImageDeleteFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MarkerNotFound => "marker_not_found",
            ErrorKind::MarkerAddFailed => "marker_add_failed",
            ErrorKind::MarkerUpdateFailed => "marker_update_failed",
            ErrorKind::MarkerDeleteFailed => "marker_delete_failed",
            ErrorKind::MarkerLoadFailed => "marker_load_failed",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::ImagePickFailed => "image_pick_failed",
            ErrorKind::ImageAttachFailed => "image_attach_failed",
            ErrorKind::ImageDeleteFailed => "image_delete_failed",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MarkerNotFound(_) => ErrorKind::MarkerNotFound,
            Error::MarkerAddFailed(_) => ErrorKind::MarkerAddFailed,
            Error::MarkerUpdateFailed(_) => ErrorKind::MarkerUpdateFailed,
            Error::MarkerDeleteFailed(_) => ErrorKind::MarkerDeleteFailed,
            Error::MarkerLoadFailed(_) => ErrorKind::MarkerLoadFailed,
            Error::PermissionDenied => ErrorKind::PermissionDenied,
            Error::ImagePickFailed(_) => ErrorKind::ImagePickFailed,
            Error::ImageAttachFailed(_) => ErrorKind::ImageAttachFailed,
            Error::ImageDeleteFailed(_) => ErrorKind::ImageDeleteFailed,
        }
    }

    /// Short text for the error banner. The full chain stays in `Display`/`source`.
    pub fn user_message(&self) -> &'static str {
        match self.kind() {
            ErrorKind::MarkerNotFound => "Marker not found",
            ErrorKind::MarkerAddFailed => "Could not add the marker",
            ErrorKind::MarkerUpdateFailed => "Could not update the marker",
            ErrorKind::MarkerDeleteFailed => "Could not delete the marker",
            ErrorKind::MarkerLoadFailed => "Could not load markers",
            ErrorKind::PermissionDenied => "Access to the media library was denied",
            ErrorKind::ImagePickFailed => "Could not pick the image",
            ErrorKind::ImageAttachFailed => "Could not save the image",
            ErrorKind::ImageDeleteFailed => "Could not delete the image",
        }
    }

    /// Detail payload, if any
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Error::MarkerNotFound(_) | Error::PermissionDenied => None,
            Error::MarkerAddFailed(cause)
            | Error::MarkerUpdateFailed(cause)
            | Error::MarkerDeleteFailed(cause)
            | Error::MarkerLoadFailed(cause)
            | Error::ImagePickFailed(cause)
            | Error::ImageAttachFailed(cause)
            | Error::ImageDeleteFailed(cause) => Some(cause),
        }
    }

    /// Underlying storage failure, if this error came from the store
    pub fn store_error(&self) -> Option<&StoreError> {
        match self.cause()? {
            Cause::Store(err) => Some(err.as_ref()),
            Cause::Message(_) => None,
        }
    }
}
