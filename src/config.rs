//! Application configuration

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use serde_with::serde_as;

use crate::errors::TrackerError;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub speed: SpeedConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub alert: Option<AlertConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub bind: SocketAddr,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    pub uri: String,
    pub port: u16,
    pub topics: Vec<String>,
    pub client_id: String,
    #[serde(default)]
    pub websocket: bool,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RetentionConfig {
    /// Fixes kept per device
    pub capacity: usize,
    /// Consecutive fixes closer than this (meters) are duplicates
    pub dedup_threshold_m: f64,
    /// A device is online if it reported within this window
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub freshness_window: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            dedup_threshold_m: crate::geo::DEFAULT_SAME_LOCATION_M,
            freshness_window: Duration::from_secs(300),
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    /// Abort the rest of a batch after this long
    #[serde_as(as = "Option<serde_with::DurationSeconds<u64>>")]
    pub batch_timeout: Option<Duration>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SpeedConfig {
    pub speed_limit_enabled: bool,
    pub dynamic_speed_limit: bool,
    pub default_speed_limit_kmh: f64,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            speed_limit_enabled: true,
            dynamic_speed_limit: true,
            default_speed_limit_kmh: 60.0,
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Any path on the monitored volume
    pub path: PathBuf,
    pub alert_threshold_percent: f64,
    /// Minimum time between samples; unset samples on every batch
    #[serde_as(as = "Option<serde_with::DurationSeconds<u64>>")]
    pub check_interval: Option<Duration>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/"),
            alert_threshold_percent: 80.0,
            check_interval: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct AlertConfig {
    /// HTTP mail relay that accepts the alert as JSON
    pub endpoint: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub recipients: Vec<String>,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_alert_timeout")]
    pub timeout: Duration,
}

fn default_max_connections() -> u32 {
    5
}

fn default_alert_timeout() -> Duration {
    Duration::from_secs(10)
}

impl AppConfig {
    pub fn load() -> Result<Self, TrackerError> {
        Self::load_from(Path::new("config/default"), false)
    }

    /// Load `file` layered under `GPSTRACKER__*` environment variables.
    pub fn load_from(file: &Path, required: bool) -> Result<Self, TrackerError> {
        let config = Config::builder()
            .add_source(File::from(file).required(required))
            .add_source(
                Environment::with_prefix("GPSTRACKER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("mqtt.topics")
                    .with_list_parse_key("alert.recipients"),
            )
            .build()?;

        let config: AppConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), TrackerError> {
        self.retention.validate()?;
        self.speed.validate()?;
        self.storage.validate()?;
        if let Some(alert) = &self.alert {
            alert.validate()?;
        }
        Ok(())
    }
}

fn invalid(message: &str) -> TrackerError {
    TrackerError::Configuration {
        message: message.to_string(),
    }
}

impl RetentionConfig {
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.capacity == 0 {
            return Err(invalid("Retention capacity must be greater than zero"));
        }
        if !self.dedup_threshold_m.is_finite() || self.dedup_threshold_m <= 0.0 {
            return Err(invalid("Dedup threshold must be a positive distance"));
        }
        Ok(())
    }
}

impl SpeedConfig {
    pub fn validate(&self) -> Result<(), TrackerError> {
        if !self.default_speed_limit_kmh.is_finite() || self.default_speed_limit_kmh <= 0.0 {
            return Err(invalid("Default speed limit must be greater than zero"));
        }
        Ok(())
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), TrackerError> {
        let threshold = self.alert_threshold_percent;
        if !(threshold > 0.0 && threshold <= 100.0) {
            return Err(invalid("Storage alert threshold must be within (0, 100]"));
        }
        if self.path.as_os_str().is_empty() {
            return Err(invalid("Storage path cannot be empty"));
        }
        if self.check_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(invalid("Storage check interval must be greater than zero"));
        }
        Ok(())
    }
}

impl AlertConfig {
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.endpoint.is_empty() {
            return Err(invalid("Alert endpoint cannot be empty"));
        }
        if self.recipients.is_empty() {
            return Err(invalid("Alert recipients cannot be empty"));
        }
        Ok(())
    }
}
