//! Device directory interface and device status

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::errors::TrackerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Disabled,
}

/// Device record as owned by the directory
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub device_id: String,
    pub name: Option<String>,
    /// Administratively disabled
    pub disabled: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl DeviceRecord {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            name: None,
            disabled: false,
            last_seen: None,
        }
    }

    /// Status as of `now`.
    ///
    /// Offline is never stored; a device goes offline once `last_seen` falls
    /// out of the freshness window.
    pub fn status(&self, now: DateTime<Utc>, freshness_window: Duration) -> DeviceStatus {
        if self.disabled {
            return DeviceStatus::Disabled;
        }
        let Some(last_seen) = self.last_seen else {
            return DeviceStatus::Offline;
        };
        // A last_seen ahead of `now` fails to_std and counts as fresh
        match now.signed_duration_since(last_seen).to_std() {
            Ok(age) if age > freshness_window => DeviceStatus::Offline,
            _ => DeviceStatus::Online,
        }
    }
}

/// Directory of known devices
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn resolve(&self, device_id: &str) -> Result<Option<DeviceRecord>, TrackerError>;

    async fn mark_online(&self, device_id: &str, at: DateTime<Utc>) -> Result<(), TrackerError>;
}

/// In-process device directory
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    devices: RwLock<HashMap<String, DeviceRecord>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices<'a>(device_ids: impl IntoIterator<Item = &'a str>) -> Self {
        let directory = Self::new();
        for device_id in device_ids {
            directory.insert(DeviceRecord::new(device_id));
        }
        directory
    }

    pub fn insert(&self, record: DeviceRecord) {
        self.devices.write().insert(record.device_id.clone(), record);
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceRecord> {
        self.devices.read().get(device_id).cloned()
    }
}

#[async_trait]
impl DeviceDirectory for MemoryDirectory {
    async fn resolve(&self, device_id: &str) -> Result<Option<DeviceRecord>, TrackerError> {
        Ok(self.get(device_id))
    }

    async fn mark_online(&self, device_id: &str, at: DateTime<Utc>) -> Result<(), TrackerError> {
        match self.devices.write().get_mut(device_id) {
            Some(record) => {
                if !record.disabled {
                    record.last_seen = Some(at);
                }
                Ok(())
            }
            None => Err(TrackerError::DeviceUnknown(device_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_follows_freshness_window() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap();
        let window = Duration::from_secs(300);
        let mut record = DeviceRecord::new("D1");
        assert_eq!(record.status(now, window), DeviceStatus::Offline);

        record.last_seen = Some(now - chrono::Duration::seconds(300));
        assert_eq!(record.status(now, window), DeviceStatus::Online);

        record.last_seen = Some(now - chrono::Duration::seconds(301));
        assert_eq!(record.status(now, window), DeviceStatus::Offline);

        record.last_seen = Some(now);
        record.disabled = true;
        assert_eq!(record.status(now, window), DeviceStatus::Disabled);
    }

    #[tokio::test]
    async fn memory_directory_marks_online() {
        let directory = MemoryDirectory::with_devices(["D1"]);
        let at = Utc::now();

        assert!(directory.resolve("D9").await.unwrap().is_none());
        directory.mark_online("D1", at).await.unwrap();
        assert_eq!(directory.get("D1").unwrap().last_seen, Some(at));
        assert!(matches!(
            directory.mark_online("D9", at).await,
            Err(TrackerError::DeviceUnknown(_))
        ));
    }

    #[tokio::test]
    async fn disabled_device_is_not_marked_online() {
        let directory = MemoryDirectory::new();
        directory.insert(DeviceRecord {
            disabled: true,
            ..DeviceRecord::new("D4")
        });

        directory.mark_online("D4", Utc::now()).await.unwrap();
        let record = directory.get("D4").unwrap();
        assert!(record.last_seen.is_none());
        assert_eq!(
            record.status(Utc::now(), Duration::from_secs(300)),
            DeviceStatus::Disabled
        );
    }
}
