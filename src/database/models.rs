use chrono::{DateTime, Utc};

use crate::{directory::DeviceRecord, models::LocationFix, retention::ArchivedFix};

#[derive(Debug, sqlx::FromRow)]
pub(super) struct DeviceRow {
    pub device_id: String,
    pub device_name: Option<String>,
    pub status: String,
    pub last_seen: Option<DateTime<Utc>>,
}

impl From<DeviceRow> for DeviceRecord {
    fn from(row: DeviceRow) -> Self {
        DeviceRecord {
            device_id: row.device_id,
            name: row.device_name,
            disabled: row.status == "disabled",
            last_seen: row.last_seen,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct LocationRow {
    pub device_id: String,
    pub seq: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl From<LocationRow> for ArchivedFix {
    fn from(row: LocationRow) -> Self {
        ArchivedFix {
            device_id: row.device_id,
            seq: row.seq.max(0) as u64,
            fix: LocationFix {
                latitude: row.latitude,
                longitude: row.longitude,
                altitude: row.altitude,
                accuracy: row.accuracy,
                speed: row.speed,
                heading: row.heading,
                timestamp: row.timestamp,
            },
        }
    }
}
