//! Concrete location providers.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{LocationProvider, LocationSample, PermissionStatus};
use crate::config::{LocationConfig, ProviderKind};
use crate::error::{Error, Result};

/// Select the provider named in the configuration.
///
/// # Errors
///
/// Returns an error if the replay track cannot be read.
pub fn provider_from_config(config: &LocationConfig) -> Result<Arc<dyn LocationProvider>> {
    let provider: Arc<dyn LocationProvider> = match config.provider {
        ProviderKind::Static => Arc::new(StaticLocationProvider::new(
            config.static_latitude,
            config.static_longitude,
        )),
        ProviderKind::Replay => {
            let path = config.replay_path.as_ref().ok_or_else(|| Error::ConfigValidation {
                message: "location.replay_path is required for the replay provider".to_string(),
            })?;
            Arc::new(ReplayLocationProvider::from_file(path)?)
        }
        ProviderKind::None => Arc::new(UnavailableLocationProvider::new(
            "location disabled in configuration",
        )),
    };
    info!(provider = provider.name(), "Location provider selected");
    Ok(provider)
}

/// Reports a fixed position. Used on hosts without positioning hardware.
#[derive(Debug, Clone)]
pub struct StaticLocationProvider {
    latitude: f64,
    longitude: f64,
    permission: PermissionStatus,
}

impl StaticLocationProvider {
    /// Create a provider that always reports the given coordinates.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            permission: PermissionStatus::Granted,
        }
    }

    /// Answer permission requests with `permission` instead of granting.
    #[must_use]
    pub fn with_permission(mut self, permission: PermissionStatus) -> Self {
        self.permission = permission;
        self
    }
}

#[async_trait::async_trait]
impl LocationProvider for StaticLocationProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn request_permission(&self) -> Result<PermissionStatus> {
        Ok(self.permission)
    }

    async fn current_position(&self) -> Result<LocationSample> {
        if self.permission == PermissionStatus::Denied {
            return Err(Error::PermissionDenied);
        }
        Ok(LocationSample::now(self.latitude, self.longitude))
    }
}

/// One point of a recorded track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

/// Walks through a recorded track, one point per read, then holds the last.
#[derive(Debug)]
pub struct ReplayLocationProvider {
    points: Vec<TrackPoint>,
    cursor: AtomicUsize,
}

impl ReplayLocationProvider {
    /// Replay the given points.
    #[must_use]
    pub fn from_points(points: Vec<TrackPoint>) -> Self {
        Self {
            points,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Load a track from a JSON array of `{latitude, longitude}` objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or holds no points.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let points: Vec<TrackPoint> = serde_json::from_str(&raw)?;
        if points.is_empty() {
            return Err(Error::tracker_unavailable(format!(
                "replay track {} is empty",
                path.display()
            )));
        }
        debug!(points = points.len(), path = %path.display(), "Replay track loaded");
        Ok(Self::from_points(points))
    }

    /// Number of points in the track.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the track has no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[async_trait::async_trait]
impl LocationProvider for ReplayLocationProvider {
    fn name(&self) -> &'static str {
        "replay"
    }

    async fn request_permission(&self) -> Result<PermissionStatus> {
        if self.points.is_empty() {
            return Err(Error::tracker_unavailable("replay track is empty"));
        }
        Ok(PermissionStatus::Granted)
    }

    async fn current_position(&self) -> Result<LocationSample> {
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        let point = self
            .points
            .get(index)
            .or_else(|| self.points.last())
            .ok_or_else(|| Error::tracker_unavailable("replay track is empty"))?;
        Ok(LocationSample::now(point.latitude, point.longitude))
    }
}

/// Stands in when the host has no location service at all.
#[derive(Debug, Clone)]
pub struct UnavailableLocationProvider {
    reason: String,
}

impl UnavailableLocationProvider {
    /// Create a provider that fails every request with `reason`.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait::async_trait]
impl LocationProvider for UnavailableLocationProvider {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    async fn request_permission(&self) -> Result<PermissionStatus> {
        Err(Error::tracker_unavailable(self.reason.clone()))
    }

    async fn current_position(&self) -> Result<LocationSample> {
        Err(Error::tracker_unavailable(self.reason.clone()))
    }
}
