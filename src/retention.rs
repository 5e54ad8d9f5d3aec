//! Per-device bounded location history
//!
//! Each device keeps a ring of the last `capacity` accepted fixes, in
//! acceptance order. A fix that arrives late with an older timestamp still
//! becomes the most recent entry once accepted.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::{config::RetentionConfig, errors::TrackerError, geo, models::LocationFix};

/// Why a fix was not retained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidCoordinates,
    Duplicate,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::InvalidCoordinates => "invalid_coordinates",
            RejectReason::Duplicate => "duplicate",
        }
    }
}

/// Acceptance event, carrying what the device directory needs to mark the
/// device online
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    /// The fix as stored, including a derived speed
    pub fix: LocationFix,
    /// Per-device acceptance sequence number, starting from 1
    pub seq: u64,
    pub accepted_at: DateTime<Utc>,
    /// Number of fixes evicted to stay within capacity
    pub evicted: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Accepted(Accepted),
    Rejected(RejectReason),
}

/// A fix read back from a [`HistoryArchive`]
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedFix {
    pub device_id: String,
    pub seq: u64,
    pub fix: LocationFix,
}

/// Durable backing for device histories.
///
/// Writes for one device may arrive out of sequence order when batches
/// overlap, so ordering always goes by `seq`, never by write order.
#[async_trait]
pub trait HistoryArchive: Send + Sync {
    /// Store an accepted fix under its acceptance sequence number
    async fn append(
        &self,
        device_id: &str,
        seq: u64,
        fix: &LocationFix,
    ) -> Result<(), TrackerError>;

    /// Drop all but the `capacity` fixes with the highest sequence numbers
    async fn trim(&self, device_id: &str, capacity: usize) -> Result<(), TrackerError>;

    /// All archived fixes, grouped by device, in sequence order
    async fn load_all(&self) -> Result<Vec<ArchivedFix>, TrackerError>;
}

/// Fixed-capacity ring of fixes, addressed by index
#[derive(Debug, Clone)]
pub struct DeviceHistory {
    slots: Vec<Option<LocationFix>>,
    /// Index the next accepted fix is written to
    head: usize,
    len: usize,
    /// Sequence number of the latest accepted fix
    last_seq: u64,
}

impl DeviceHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            head: 0,
            len: 0,
            last_seq: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Write a fix, returning the evicted oldest entry when full.
    pub fn push(&mut self, fix: LocationFix) -> Option<LocationFix> {
        self.last_seq += 1;
        let evicted = self.slots[self.head].replace(fix);
        self.head = (self.head + 1) % self.capacity();
        if self.len < self.capacity() {
            self.len += 1;
        }
        evicted
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Continue numbering after `seq` if it is ahead of the local count.
    pub fn resume_after(&mut self, seq: u64) {
        self.last_seq = self.last_seq.max(seq);
    }

    /// Most recently accepted fix
    pub fn latest(&self) -> Option<&LocationFix> {
        if self.is_empty() {
            return None;
        }
        let index = (self.head + self.capacity() - 1) % self.capacity();
        self.slots[index].as_ref()
    }

    /// Fixes in acceptance order, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &LocationFix> {
        let start = (self.head + self.capacity() - self.len) % self.capacity();
        (0..self.len).filter_map(move |offset| {
            self.slots[(start + offset) % self.capacity()].as_ref()
        })
    }
}

/// Retention store for all devices.
///
/// Each device history sits behind its own lock, so work on one device
/// never waits for another. The outer map lock is only held to look up or
/// create a device entry.
pub struct RetentionStore {
    capacity: usize,
    dedup_threshold_m: f64,
    devices: RwLock<HashMap<String, Arc<Mutex<DeviceHistory>>>>,
}

impl RetentionStore {
    pub fn new(config: &RetentionConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            dedup_threshold_m: config.dedup_threshold_m,
            devices: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn get(&self, device_id: &str) -> Option<Arc<Mutex<DeviceHistory>>> {
        self.devices.read().get(device_id).cloned()
    }

    fn get_or_create(&self, device_id: &str) -> Arc<Mutex<DeviceHistory>> {
        if let Some(history) = self.get(device_id) {
            return history;
        }
        self.devices
            .write()
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DeviceHistory::new(self.capacity))))
            .clone()
    }

    /// Validate, dedup and retain a fix.
    pub fn submit(&self, device_id: &str, mut fix: LocationFix) -> SubmitOutcome {
        if !fix.has_valid_coordinates() {
            debug!(device_id, "Rejecting fix with invalid coordinates");
            return SubmitOutcome::Rejected(RejectReason::InvalidCoordinates);
        }

        let history = self.get_or_create(device_id);
        let mut history = history.lock();

        if let Some(previous) = history.latest() {
            if geo::is_same_location(
                fix.latitude,
                fix.longitude,
                previous.latitude,
                previous.longitude,
                self.dedup_threshold_m,
            ) {
                debug!(device_id, "Rejecting duplicate fix");
                return SubmitOutcome::Rejected(RejectReason::Duplicate);
            }
            if fix.speed.is_none() {
                fix.speed = Some(geo::speed_kmh(
                    previous.latitude,
                    previous.longitude,
                    previous.timestamp,
                    fix.latitude,
                    fix.longitude,
                    fix.timestamp,
                ));
            }
        }

        let evicted = history.push(fix.clone()).map_or(0, |_| 1);
        SubmitOutcome::Accepted(Accepted {
            fix,
            seq: history.last_seq(),
            accepted_at: Utc::now(),
            evicted,
        })
    }

    /// Most recently accepted fix of a device
    pub fn latest(&self, device_id: &str) -> Option<LocationFix> {
        let history = self.get(device_id)?;
        let history = history.lock();
        history.latest().cloned()
    }

    /// Retained fixes ordered by fix timestamp, optionally limited to the
    /// closed interval `[start, end]`. Unknown devices have an empty history.
    pub fn history(
        &self,
        device_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<LocationFix> {
        let Some(history) = self.get(device_id) else {
            return Vec::new();
        };
        let mut fixes: Vec<LocationFix> = history
            .lock()
            .iter()
            .filter(|fix| start.map_or(true, |start| fix.timestamp >= start))
            .filter(|fix| end.map_or(true, |end| fix.timestamp <= end))
            .cloned()
            .collect();
        // Stable, so equal timestamps keep acceptance order
        fixes.sort_by_key(|fix| fix.timestamp);
        fixes
    }

    /// Retained fixes in acceptance order, oldest first
    pub fn accepted(&self, device_id: &str) -> Vec<LocationFix> {
        self.get(device_id)
            .map(|history| history.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Put previously accepted fixes back without validation or dedup.
    pub fn restore(&self, device_id: &str, fixes: impl IntoIterator<Item = LocationFix>) {
        let history = self.get_or_create(device_id);
        let mut history = history.lock();
        for fix in fixes {
            history.push(fix);
        }
    }

    /// Rebuild the store from an archive, returning the number of fixes read.
    pub async fn restore_from(&self, archive: &dyn HistoryArchive) -> Result<usize, TrackerError> {
        let rows = archive.load_all().await?;
        let count = rows.len();
        for row in rows {
            let history = self.get_or_create(&row.device_id);
            let mut history = history.lock();
            history.push(row.fix);
            history.resume_after(row.seq);
        }
        info!("Restored {} archived fixes for {} devices", count, self.device_count());
        Ok(count)
    }

    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }
}
