//! Configuration management for safeguard.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::location::{
    SamplingPolicy, DEFAULT_DISTANCE_FILTER_M, DEFAULT_PERMISSION_TIMEOUT, DEFAULT_POLL_INTERVAL,
    DEFAULT_SAMPLE_INTERVAL,
};
use crate::notify::DEFAULT_DISPATCH_TIMEOUT;
use crate::session::{DEFAULT_AUTO_CANCEL_WINDOW, DEFAULT_COUNTDOWN_TICK, DEFAULT_SENDER_NAME};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "safeguard";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "safeguard.db";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `SAFEGUARD_`)
/// 2. TOML config file at `~/.config/safeguard/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Emergency session configuration.
    pub session: SessionConfig,
    /// Location tracking configuration.
    pub location: LocationConfig,
    /// Notification configuration.
    pub notify: NotifyConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
}

/// Emergency session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Length of the auto-cancel countdown in seconds.
    pub auto_cancel_window_secs: u64,
    /// Period of the countdown producer in milliseconds.
    pub countdown_tick_ms: u64,
    /// Record resolved sessions in storage.
    pub record_history: bool,
    /// Keep the last position in the history record.
    pub record_location: bool,
}

/// Which location provider to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Fixed coordinates from this configuration.
    #[default]
    Static,
    /// Recorded track from `replay_path`.
    Replay,
    /// No location service.
    None,
}

/// Location tracking configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Provider selected at start-up.
    pub provider: ProviderKind,
    /// Emit a sample at least every this many seconds.
    pub sample_interval_secs: u64,
    /// Emit a sample after moving this many meters.
    pub distance_filter_m: f64,
    /// How often the provider is read, in milliseconds.
    pub poll_interval_ms: u64,
    /// Bound on permission requests, in milliseconds.
    pub permission_timeout_ms: u64,
    /// Latitude reported by the static provider.
    pub static_latitude: f64,
    /// Longitude reported by the static provider.
    pub static_longitude: f64,
    /// JSON track file for the replay provider.
    pub replay_path: Option<PathBuf>,
}

/// Which notification transport to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Write alerts to the log.
    #[default]
    Log,
    /// POST alerts to a messaging backend.
    Http,
}

/// Notification configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Transport selected at start-up.
    pub transport: TransportKind,
    /// Messaging backend URL for the HTTP transport.
    pub endpoint: Option<String>,
    /// Bound on each per-contact dispatch, in milliseconds.
    pub timeout_ms: u64,
    /// Name used in alert texts.
    pub sender_name: String,
}

/// Storage-related configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/safeguard/safeguard.db`
    pub database_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_cancel_window_secs: DEFAULT_AUTO_CANCEL_WINDOW.as_secs(),
            countdown_tick_ms: millis(DEFAULT_COUNTDOWN_TICK),
            record_history: true,
            record_location: false,
        }
    }
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Static,
            sample_interval_secs: DEFAULT_SAMPLE_INTERVAL.as_secs(),
            distance_filter_m: DEFAULT_DISTANCE_FILTER_M,
            poll_interval_ms: millis(DEFAULT_POLL_INTERVAL),
            permission_timeout_ms: millis(DEFAULT_PERMISSION_TIMEOUT),
            static_latitude: 0.0,
            static_longitude: 0.0,
            replay_path: None,
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Log,
            endpoint: None,
            timeout_ms: millis(DEFAULT_DISPATCH_TIMEOUT),
            sender_name: DEFAULT_SENDER_NAME.to_string(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ConfigValidation {
        message: message.into(),
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed("SAFEGUARD_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.session.auto_cancel_window_secs == 0 {
            return Err(invalid("session.auto_cancel_window_secs must be greater than 0"));
        }
        if self.session.countdown_tick_ms == 0 {
            return Err(invalid("session.countdown_tick_ms must be greater than 0"));
        }

        let location = &self.location;
        if location.sample_interval_secs == 0 {
            return Err(invalid("location.sample_interval_secs must be greater than 0"));
        }
        if location.poll_interval_ms == 0 {
            return Err(invalid("location.poll_interval_ms must be greater than 0"));
        }
        if location.permission_timeout_ms == 0 {
            return Err(invalid("location.permission_timeout_ms must be greater than 0"));
        }
        if !location.distance_filter_m.is_finite() || location.distance_filter_m < 0.0 {
            return Err(invalid(format!(
                "location.distance_filter_m must be a non-negative number, got {}",
                location.distance_filter_m
            )));
        }
        if !(-90.0..=90.0).contains(&location.static_latitude) {
            return Err(invalid(format!(
                "location.static_latitude out of range: {}",
                location.static_latitude
            )));
        }
        if !(-180.0..=180.0).contains(&location.static_longitude) {
            return Err(invalid(format!(
                "location.static_longitude out of range: {}",
                location.static_longitude
            )));
        }
        if location.provider == ProviderKind::Replay && location.replay_path.is_none() {
            return Err(invalid(
                "location.replay_path is required for the replay provider",
            ));
        }

        if self.notify.timeout_ms == 0 {
            return Err(invalid("notify.timeout_ms must be greater than 0"));
        }
        if self.notify.transport == TransportKind::Http
            && self.notify.endpoint.as_deref().map_or(true, str::is_empty)
        {
            return Err(invalid("notify.endpoint is required for the http transport"));
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the auto-cancel window as a Duration.
    #[must_use]
    pub fn auto_cancel_window(&self) -> Duration {
        Duration::from_secs(self.session.auto_cancel_window_secs)
    }

    /// Get the countdown tick period as a Duration.
    #[must_use]
    pub fn countdown_tick(&self) -> Duration {
        Duration::from_millis(self.session.countdown_tick_ms)
    }

    /// Get the sampling policy for the location tracker.
    #[must_use]
    pub fn sampling_policy(&self) -> SamplingPolicy {
        SamplingPolicy {
            interval: Duration::from_secs(self.location.sample_interval_secs),
            distance_m: self.location.distance_filter_m,
        }
    }

    /// Get the provider poll interval as a Duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.location.poll_interval_ms)
    }

    /// Get the permission request timeout as a Duration.
    #[must_use]
    pub fn permission_timeout(&self) -> Duration {
        Duration::from_millis(self.location.permission_timeout_ms)
    }

    /// Get the per-contact dispatch timeout as a Duration.
    #[must_use]
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.notify.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.session.auto_cancel_window_secs, 30);
        assert!(config.session.record_history);
        assert!(!config.session.record_location);
        assert_eq!(config.location.provider, ProviderKind::Static);
        assert_eq!(config.notify.transport, TransportKind::Log);
        assert!(config.storage.database_path.is_none());
    }

    #[test]
    fn test_default_location_config() {
        let location = LocationConfig::default();

        assert_eq!(location.sample_interval_secs, 5);
        assert!((location.distance_filter_m - 5.0).abs() < f64::EPSILON);
        assert_eq!(location.poll_interval_ms, 1000);
        assert_eq!(location.permission_timeout_ms, 3000);
        assert!(location.replay_path.is_none());
    }

    #[test]
    fn test_default_notify_config() {
        let notify = NotifyConfig::default();

        assert_eq!(notify.timeout_ms, 3000);
        assert!(notify.endpoint.is_none());
        assert!(!notify.sender_name.is_empty());
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_window() {
        let mut config = Config::default();
        config.session.auto_cancel_window_secs = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("auto_cancel_window_secs"));
    }

    #[test]
    fn test_validate_negative_distance() {
        let mut config = Config::default();
        config.location.distance_filter_m = -1.0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("distance_filter_m"));
    }

    #[test]
    fn test_validate_nan_distance() {
        let mut config = Config::default();
        config.location.distance_filter_m = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_latitude_range() {
        let mut config = Config::default();
        config.location.static_latitude = 91.0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("static_latitude"));
    }

    #[test]
    fn test_validate_replay_without_path() {
        let mut config = Config::default();
        config.location.provider = ProviderKind::Replay;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("replay_path"));
    }

    #[test]
    fn test_validate_http_without_endpoint() {
        let mut config = Config::default();
        config.notify.transport = TransportKind::Http;
        assert!(config.validate().is_err());

        config.notify.endpoint = Some("https://alerts.example.com/sos".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_accessors() {
        let config = Config::default();

        assert_eq!(config.auto_cancel_window(), Duration::from_secs(30));
        assert_eq!(config.countdown_tick(), Duration::from_secs(1));
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.permission_timeout(), Duration::from_secs(3));
        assert_eq!(config.dispatch_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_sampling_policy_from_config() {
        let mut config = Config::default();
        config.location.sample_interval_secs = 10;
        config.location.distance_filter_m = 25.0;

        let policy = config.sampling_policy();
        assert_eq!(policy.interval, Duration::from_secs(10));
        assert!((policy.distance_m - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_database_path_default() {
        let config = Config::default();
        assert!(config
            .database_path()
            .to_string_lossy()
            .contains("safeguard.db"));
    }

    #[test]
    fn test_database_path_custom() {
        let mut config = Config::default();
        config.storage.database_path = Some(PathBuf::from("/custom/path/db.sqlite"));

        assert_eq!(
            config.database_path(),
            PathBuf::from("/custom/path/db.sqlite")
        );
    }

    #[test]
    fn test_default_config_path() {
        let path = Config::default_config_path();
        assert!(path.to_string_lossy().contains("safeguard"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_load_nonexistent_config() {
        let result = Config::load_from(Some(PathBuf::from("/nonexistent/config.toml")));
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), Config::default());
    }

    #[test]
    fn test_load_from_toml_file() {
        let path = std::env::temp_dir().join(format!("safeguard_config_{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "[session]\nauto_cancel_window_secs = 60\n\n[location]\nprovider = \"none\"\n",
        )
        .unwrap();

        let config = Config::load_from(Some(path.clone())).unwrap();
        assert_eq!(config.session.auto_cancel_window_secs, 60);
        assert_eq!(config.location.provider, ProviderKind::None);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_provider_kind_deserialize() {
        let kind: ProviderKind = serde_json::from_str("\"replay\"").unwrap();
        assert_eq!(kind, ProviderKind::Replay);
    }

    #[test]
    fn test_config_serialize() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        assert!(json.contains("auto_cancel_window_secs"));
        assert!(json.contains("distance_filter_m"));
    }
}
