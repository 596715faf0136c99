//! Marker types - the domain model shared by storage, cache and UI
//!
//! - `Marker`: a user-placed point of interest with title, description and images
//! - `Image`: a device-local photo reference owned by exactly one marker
//! - `NewMarker` / `NewImage` / `MarkerUpdate`: inputs for the mutators

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// WGS84 position in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Check that both components are finite and within range
    pub fn validate(&self) -> Result<(), String> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(format!("Latitude out of range: {}", self.latitude));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(format!("Longitude out of range: {}", self.longitude));
        }
        Ok(())
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}, {:.6}", self.latitude, self.longitude)
    }
}

/// A photo attached to a marker. Holds a reference, never the bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    /// Device-local URI (e.g. `file://...`)
    pub uri: String,
    /// Display name
    pub name: String,
    pub date_added: DateTime<Utc>,
    /// Size in bytes, when the picker reported one
    pub size: Option<u64>,
    /// MIME type, when the picker reported one
    #[serde(rename = "type")]
    pub mime_type: Option<String>,
}

/// A marker with all of its images, in attachment order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub id: String,
    pub coordinate: Coordinate,
    pub title: String,
    pub description: String,
    pub images: Vec<Image>,
    pub created_at: DateTime<Utc>,
    /// Set by title/description edits only
    pub updated_at: Option<DateTime<Utc>>,
}

impl Marker {
    pub fn image(&self, image_id: &str) -> Option<&Image> {
        self.images.iter().find(|image| image.id == image_id)
    }
}

/// Input for creating a marker. Omitted fields are defaulted by the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMarker {
    pub coordinate: Coordinate,
    pub title: Option<String>,
    pub description: Option<String>,
}

impl NewMarker {
    pub fn new(coordinate: Coordinate) -> Self {
        Self {
            coordinate,
            title: None,
            description: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// An image about to be attached (no id yet)
#[derive(Debug, Clone, PartialEq)]
pub struct NewImage {
    pub uri: String,
    pub name: String,
    pub date_added: DateTime<Utc>,
    pub size: Option<u64>,
    pub mime_type: Option<String>,
}

impl NewImage {
    pub fn new(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            date_added: Utc::now(),
            size: None,
            mime_type: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn added_at(mut self, date_added: DateTime<Utc>) -> Self {
        self.date_added = date_added;
        self
    }
}

/// Title/description edit. `None` leaves the field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarkerUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
}

impl MarkerUpdate {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.description.is_none()
    }
}

/// New opaque id: UUIDv7, so time-ordered with random low bits
pub fn new_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Storage format for timestamps. Millisecond RFC 3339 in UTC sorts lexically.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|ts| ts.with_timezone(&Utc))
}
