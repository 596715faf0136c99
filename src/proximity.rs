//! Proximity tracking - "you are near a marker" over position samples
//!
//! The tracker only reads a marker list handed to it. It keeps the set of
//! markers currently in range so each approach alerts once.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::marker::{Coordinate, Marker};

/// Mean earth radius in metres
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub const DEFAULT_THRESHOLD_M: f64 = 100.0;

/// One sample from the position stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy in metres, if reported
    pub accuracy: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy: None,
            timestamp: Utc::now(),
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

/// Great-circle distance in metres (haversine)
pub fn distance_meters(a: &Coordinate, b: &Coordinate) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProximityAlert {
    pub marker_id: String,
    pub title: String,
    pub distance_m: f64,
}

#[derive(Debug, Clone)]
pub struct ProximityTracker {
    threshold_m: f64,
    in_range: HashSet<String>,
}

impl Default for ProximityTracker {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD_M)
    }
}

impl ProximityTracker {
    pub fn new(threshold_m: f64) -> Self {
        Self {
            threshold_m,
            in_range: HashSet::new(),
        }
    }

    pub fn threshold_m(&self) -> f64 {
        self.threshold_m
    }

    /// Alerts for markers entered since the previous sample, nearest first.
    /// A marker re-arms once the position leaves its radius.
    pub fn observe(&mut self, position: &Position, markers: &[Marker]) -> Vec<ProximityAlert> {
        let here = position.coordinate();
        let mut alerts = Vec::new();
        let mut now_in_range = HashSet::new();

        for marker in markers {
            let distance_m = distance_meters(&here, &marker.coordinate);
            if distance_m > self.threshold_m {
                continue;
            }
            if !self.in_range.contains(&marker.id) {
                tracing::debug!("Entered range of marker {} ({:.0} m)", marker.id, distance_m);
                alerts.push(ProximityAlert {
                    marker_id: marker.id.clone(),
                    title: marker.title.clone(),
                    distance_m,
                });
            }
            now_in_range.insert(marker.id.clone());
        }

        self.in_range = now_in_range;
        alerts.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
        alerts
    }

    /// Markers within the threshold of `coordinate`, nearest first. Stateless.
    pub fn nearby<'a>(&self, coordinate: &Coordinate, markers: &'a [Marker]) -> Vec<(&'a Marker, f64)> {
        let mut found: Vec<_> = markers
            .iter()
            .map(|marker| (marker, distance_meters(coordinate, &marker.coordinate)))
            .filter(|(_, distance)| *distance <= self.threshold_m)
            .collect();
        found.sort_by(|a, b| a.1.total_cmp(&b.1));
        found
    }

    pub fn clear(&mut self) {
        self.in_range.clear();
    }
}
