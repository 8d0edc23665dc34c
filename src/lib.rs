//! # Ride Recorder
//!
//! GPS ride recording and ride lifecycle for the mobile app.
//!
//! This library provides:
//! - A ride state machine (record / pause / resume / stop / cancel) with
//!   segment-based point accumulation and haversine distance
//! - Periodic "new miles" reconciliation against the matching service
//! - Durable SQLite storage of finished rides with upload-status tracking
//! - An upload monitor with exponential backoff and resumable uploads
//! - Achievement detection for finished rides
//!
//! ## Features
//!
//! - **`ffi`** - Enable FFI bindings for mobile platforms (iOS/Android)
//!
//! ## Quick Start
//!
//! ```rust
//! use ride_recorder::{GpsFix, RideStateStore, RideState};
//!
//! let mut ride = RideStateStore::new();
//! ride.start(1_700_000_000_000).unwrap();
//! ride.add_fix(&GpsFix::new(51.5074, -0.1278, 1_700_000_001_000));
//! ride.add_fix(&GpsFix::new(51.5084, -0.1278, 1_700_000_011_000));
//!
//! let snapshot = ride.snapshot(1_700_000_011_000);
//! assert_eq!(snapshot.state, RideState::Tracking);
//! assert!(snapshot.distance_meters > 100.0);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, RideError};

// Configuration for recorder, uploads and the remote API
pub mod config;
pub use config::{ApiConfig, Config, RecorderConfig, UploadConfig};

// Geographic utilities (distance, speed, bounds)
pub mod geo_utils;

// Location permission and GPS fix filtering
pub mod location;
pub use location::{FixVerdict, LocationPermission, LocationStore};

// Ride state machine and segment accumulation
pub mod ride_state;
pub use ride_state::{FinishedRide, RideSnapshot, RideStateStore, Segment, SegmentFix};

// New miles reconciliation
pub mod new_miles;
pub use new_miles::{NewMilesRequest, NewMilesResponse, NewMilesTracker};

// SQLite ride storage
pub mod store;
pub use store::{RideStore, RideStoreStats, SharedStore, StoredRide};

// Remote ride API
pub mod api;
pub use api::{HttpRideApi, PointChunk, RideApi, RideUpload};

// Upload monitor with retry/backoff
pub mod upload;
pub use upload::{retry_delay, UploadMonitor, UploadOutcome, UploadReport};

// Ride achievements
pub mod achievements;
pub use achievements::{detect_achievements, Achievement, AchievementType, RideRecord};

// Ride service orchestrating everything above
pub mod ride_service;
pub use ride_service::{RideService, StopOutcome};

// FFI bindings for mobile platforms (iOS/Android)
#[cfg(feature = "ffi")]
pub mod ffi;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("RideRecorder"),
    );
}

/// Initialize logging for iOS
#[cfg(target_os = "ios")]
pub fn init_logging() {
    use log::LevelFilter;

    // Fails only if a logger is already installed
    let _ = oslog::OsLogger::new("com.riderecorder")
        .level_filter(LevelFilter::Debug)
        .init();
}

#[cfg(not(any(target_os = "android", target_os = "ios")))]
pub fn init_logging() {
    // No-op on non-mobile platforms
}

/// Current wall-clock time as unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// A raw fix as delivered by the platform location service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Horizontal accuracy radius in meters, if reported
    pub accuracy: Option<f64>,
    /// Ground speed in m/s, if reported (negative means unknown on iOS)
    pub speed: Option<f64>,
    /// Altitude in meters, if reported
    pub altitude: Option<f64>,
}

impl GpsFix {
    /// Create a fix with only a position and timestamp.
    pub fn new(latitude: f64, longitude: f64, timestamp: i64) -> Self {
        Self {
            latitude,
            longitude,
            timestamp,
            accuracy: None,
            speed: None,
            altitude: None,
        }
    }

    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }

    pub fn is_valid(&self) -> bool {
        self.point().is_valid()
    }
}

/// Bounding box for a ride.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Create bounds from GPS points.
    pub fn from_points(points: &[GpsPoint]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let mut min_lat = f64::MAX;
        let mut max_lat = f64::MIN;
        let mut min_lng = f64::MAX;
        let mut max_lng = f64::MIN;

        for p in points {
            min_lat = min_lat.min(p.latitude);
            max_lat = max_lat.max(p.latitude);
            min_lng = min_lng.min(p.longitude);
            max_lng = max_lng.max(p.longitude);
        }

        Some(Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        })
    }

    /// Get the center point of the bounds.
    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    /// Whether two boxes share any area (touching edges count).
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
            && self.min_lng <= other.max_lng
            && self.max_lng >= other.min_lng
    }
}

/// Recorder lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum RideState {
    NotTracking,
    Tracking,
    Paused,
    /// Stopped, waiting for the ride to be persisted
    Finishing,
}

impl fmt::Display for RideState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RideState::NotTracking => "not tracking",
            RideState::Tracking => "tracking",
            RideState::Paused => "paused",
            RideState::Finishing => "finishing",
        };
        f.write_str(s)
    }
}

/// Upload status of a stored ride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum UploadStatus {
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Uploaded => "uploaded",
            UploadStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = RideError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(UploadStatus::Pending),
            "uploading" => Ok(UploadStatus::Uploading),
            "uploaded" => Ok(UploadStatus::Uploaded),
            "failed" => Ok(UploadStatus::Failed),
            other => Err(RideError::Internal {
                message: format!("Unknown upload status '{}'", other),
            }),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
