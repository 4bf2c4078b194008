//! Location sampling for active emergencies.
//!
//! Positions come from a platform [`LocationProvider`] chosen once at start-up.
//! The [`LocationTracker`] polls it and forwards samples that pass the
//! distance-or-time [`SamplingPolicy`].

pub mod provider;
pub mod tracker;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use provider::{
    provider_from_config, ReplayLocationProvider, StaticLocationProvider, TrackPoint,
    UnavailableLocationProvider,
};
pub use tracker::{LocationTracker, SubscriptionId};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Emit a sample at least this often while the device is stationary.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Emit a sample as soon as the device has moved this far (meters).
pub const DEFAULT_DISTANCE_FILTER_M: f64 = 5.0;

/// How often the provider is read.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on a permission request.
pub const DEFAULT_PERMISSION_TIMEOUT: Duration = Duration::from_secs(3);

/// A single position fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// When the fix was taken.
    pub captured_at: DateTime<Utc>,
}

impl LocationSample {
    /// Create a sample captured at the given time.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            captured_at,
        }
    }

    /// Create a sample captured now.
    #[must_use]
    pub fn now(latitude: f64, longitude: f64) -> Self {
        Self::new(latitude, longitude, Utc::now())
    }

    /// Great-circle distance to another sample, in meters.
    #[must_use]
    pub fn distance_to(&self, other: &Self) -> f64 {
        haversine_distance(self.latitude, self.longitude, other.latitude, other.longitude)
    }

    /// A map link suitable for a text message.
    #[must_use]
    pub fn maps_url(&self) -> String {
        format!(
            "https://maps.google.com/?q={:.6},{:.6}",
            self.latitude, self.longitude
        )
    }
}

/// Haversine distance between two coordinates, in meters.
#[must_use]
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Answer to a location permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    /// Location access allowed.
    Granted,
    /// Location access refused.
    Denied,
}

/// What the tracker currently knows about location access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    /// Never asked.
    #[default]
    Unknown,
    /// Access allowed.
    Granted,
    /// Access refused.
    Denied,
    /// No location service on this host.
    Unavailable,
}

impl fmt::Display for PermissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Granted => write!(f, "granted"),
            Self::Denied => write!(f, "denied"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Platform capability supplying permission answers and position fixes.
///
/// One implementation is selected at start-up (see [`provider_from_config`]);
/// nothing else in the crate branches on the platform.
#[async_trait::async_trait]
pub trait LocationProvider: Send + Sync + fmt::Debug {
    /// Name of this provider (for logging).
    fn name(&self) -> &'static str;

    /// Ask the platform for location access.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::TrackerUnavailable`] if there is no location
    /// service to ask.
    async fn request_permission(&self) -> Result<PermissionStatus>;

    /// Read the current position.
    ///
    /// # Errors
    ///
    /// Returns an error if no fix can be obtained right now.
    async fn current_position(&self) -> Result<LocationSample>;
}

/// Distance-or-time trigger deciding which polled fixes become samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingPolicy {
    /// Emit when this much time has passed since the last emitted sample.
    pub interval: Duration,
    /// Emit when the device moved at least this far (meters).
    pub distance_m: f64,
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SAMPLE_INTERVAL,
            distance_m: DEFAULT_DISTANCE_FILTER_M,
        }
    }
}

impl SamplingPolicy {
    /// Decide whether `candidate` should be emitted after `last`.
    ///
    /// The first fix is always emitted. Fixes older than the last emitted one
    /// are never emitted, which keeps `captured_at` non-decreasing.
    #[must_use]
    pub fn should_emit(&self, last: Option<&LocationSample>, candidate: &LocationSample) -> bool {
        let Some(last) = last else {
            return true;
        };
        if candidate.captured_at < last.captured_at {
            return false;
        }
        let elapsed = (candidate.captured_at - last.captured_at)
            .to_std()
            .unwrap_or_default();
        elapsed >= self.interval || last.distance_to(candidate) >= self.distance_m
    }
}
