//! Postgres-backed device directory and history archive

mod models;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{error, info};

use crate::{
    config::DatabaseConfig,
    directory::{DeviceDirectory, DeviceRecord},
    errors::TrackerError,
    models::LocationFix,
    retention::{ArchivedFix, HistoryArchive},
};
use models::{DeviceRow, LocationRow};

#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect and run migrations
    pub async fn from_config(config: &DatabaseConfig) -> Result<Self, TrackerError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| {
                error!("Failed to connect to database: {}", e);
                e
            })?;
        Self::new(pool).await
    }

    pub async fn new(pool: PgPool) -> Result<Self, TrackerError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Insert a device if it is not known yet
    pub async fn register_device(
        &self,
        device_id: &str,
        name: Option<&str>,
    ) -> Result<(), TrackerError> {
        sqlx::query(
            "INSERT INTO devices (device_id, device_name) VALUES ($1, $2)
             ON CONFLICT (device_id) DO NOTHING",
        )
        .bind(device_id)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceDirectory for Database {
    async fn resolve(&self, device_id: &str) -> Result<Option<DeviceRecord>, TrackerError> {
        let row: Option<DeviceRow> = sqlx::query_as(
            "SELECT device_id, device_name, status, last_seen FROM devices WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(DeviceRecord::from))
    }

    async fn mark_online(&self, device_id: &str, at: DateTime<Utc>) -> Result<(), TrackerError> {
        sqlx::query(
            "UPDATE devices SET status = 'online', last_seen = $2
             WHERE device_id = $1 AND status <> 'disabled'",
        )
        .bind(device_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryArchive for Database {
    async fn append(
        &self,
        device_id: &str,
        seq: u64,
        fix: &LocationFix,
    ) -> Result<(), TrackerError> {
        sqlx::query(
            "INSERT INTO location_current (
                device_id, seq, latitude, longitude, altitude,
                accuracy, speed, heading, timestamp
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(device_id)
        .bind(seq as i64)
        .bind(fix.latitude)
        .bind(fix.longitude)
        .bind(fix.altitude)
        .bind(fix.accuracy)
        .bind(fix.speed)
        .bind(fix.heading)
        .bind(fix.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn trim(&self, device_id: &str, capacity: usize) -> Result<(), TrackerError> {
        sqlx::query(
            "DELETE FROM location_current
             WHERE device_id = $1 AND seq NOT IN (
                SELECT seq FROM location_current
                WHERE device_id = $1
                ORDER BY seq DESC
                LIMIT $2
             )",
        )
        .bind(device_id)
        .bind(capacity as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<ArchivedFix>, TrackerError> {
        let rows: Vec<LocationRow> = sqlx::query_as(
            "SELECT device_id, seq, latitude, longitude, altitude, accuracy, speed, heading,
                    timestamp
             FROM location_current
             ORDER BY device_id, seq",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
