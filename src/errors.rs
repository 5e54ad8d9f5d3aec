//! Errors for the GPS tracker
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("MQTT client error")]
    MqttClientError(#[from] rumqttc::ClientError),

    #[error("Serialization error")]
    SerdeError(#[from] serde_json::Error),

    #[error("Configuration error")]
    ConfigError(#[from] config::ConfigError),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("IO error")]
    IoError(#[from] std::io::Error),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Unknown device: {0}")]
    DeviceUnknown(String),

    #[error("Storage usage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Database migration error")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("Database error")]
    DatabaseError(#[from] sqlx::Error),
}
