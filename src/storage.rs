//! Storage pressure monitor
//!
//! Samples disk usage of the volume holding the tracker's data and sends a
//! storage alert through the configured notifier when usage is above the
//! alert threshold.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::Disks;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    config::StorageConfig,
    errors::TrackerError,
    notifier::{AlertMessage, Notifier},
};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Point-in-time usage of one volume
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StorageSample {
    pub usage_percent: f64,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

impl StorageSample {
    pub fn from_capacity(total_bytes: u64, free_bytes: u64) -> Self {
        let free_bytes = free_bytes.min(total_bytes);
        let used_bytes = total_bytes - free_bytes;
        let usage_percent = if total_bytes == 0 {
            0.0
        } else {
            used_bytes as f64 * 100.0 / total_bytes as f64
        };
        Self {
            usage_percent,
            total_bytes,
            used_bytes,
            free_bytes,
        }
    }

    pub fn free_gb(&self) -> f64 {
        self.free_bytes as f64 / GIB
    }

    pub fn total_gb(&self) -> f64 {
        self.total_bytes as f64 / GIB
    }
}

/// Result of a threshold check
#[derive(Debug, Clone, PartialEq)]
pub enum AlertOutcome {
    AlertSent,
    NoAlert,
    AlertFailed(String),
}

/// Source of usage samples
pub trait UsageProbe: Send + Sync {
    fn sample(&self, path: &Path) -> Result<StorageSample, TrackerError>;
}

/// Reads usage of the mounted disk that contains the path
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskProbe;

impl UsageProbe for DiskProbe {
    fn sample(&self, path: &Path) -> Result<StorageSample, TrackerError> {
        let path = path.canonicalize()?;
        let disks = Disks::new_with_refreshed_list();
        let mounts = disks
            .iter()
            .map(|disk| (disk.mount_point(), disk.total_space(), disk.available_space()));

        match select_mount(mounts, &path) {
            Some((total, free)) => Ok(StorageSample::from_capacity(total, free)),
            None => Err(TrackerError::StorageUnavailable(format!(
                "no mounted disk contains {}",
                path.display()
            ))),
        }
    }
}

/// Capacity `(total, free)` of the mount with the longest mount point that
/// is a prefix of `path`.
fn select_mount<'a>(
    mounts: impl IntoIterator<Item = (&'a Path, u64, u64)>,
    path: &Path,
) -> Option<(u64, u64)> {
    mounts
        .into_iter()
        .filter(|(mount_point, _, _)| path.starts_with(mount_point))
        .max_by_key(|(mount_point, _, _)| mount_point.components().count())
        .map(|(_, total, free)| (total, free))
}

/// Build the storage shortage alert
pub fn storage_alert(sample: &StorageSample, threshold_percent: f64) -> AlertMessage {
    AlertMessage {
        subject: "Server storage capacity warning".to_string(),
        body: format!(
            "Server storage is running low and needs attention.\n\
             Usage: {:.1}% (alert threshold {:.1}%)\n\
             Free: {:.2} GB of {:.2} GB",
            sample.usage_percent,
            threshold_percent,
            sample.free_gb(),
            sample.total_gb()
        ),
    }
}

pub struct StorageMonitor {
    path: PathBuf,
    threshold_percent: f64,
    check_interval: Option<Duration>,
    probe: Arc<dyn UsageProbe>,
    notifier: Arc<dyn Notifier>,
    notify_timeout: Duration,
    last_check: Mutex<Option<Instant>>,
}

impl StorageMonitor {
    pub fn new(config: &StorageConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self::with_probe(config, notifier, Box::new(DiskProbe))
    }

    pub fn with_probe(
        config: &StorageConfig,
        notifier: Arc<dyn Notifier>,
        probe: Box<dyn UsageProbe>,
    ) -> Self {
        Self {
            path: config.path.clone(),
            threshold_percent: config.alert_threshold_percent,
            check_interval: config.check_interval,
            probe: Arc::from(probe),
            notifier,
            notify_timeout: Duration::from_secs(30),
            last_check: Mutex::new(None),
        }
    }

    /// Upper bound on a single notifier call
    pub fn notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    pub fn threshold_percent(&self) -> f64 {
        self.threshold_percent
    }

    /// Synchronously sample usage of the monitored volume
    pub fn sample(&self) -> Result<StorageSample, TrackerError> {
        self.probe.sample(&self.path)
    }

    /// Sample on the blocking thread pool, keeping disk enumeration off the
    /// async workers.
    pub async fn sample_blocking(&self) -> Result<StorageSample, TrackerError> {
        let probe = Arc::clone(&self.probe);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || probe.sample(&path))
            .await
            .map_err(|e| {
                TrackerError::StorageUnavailable(format!("sampling task failed: {}", e))
            })?
    }

    /// Alert if usage is strictly above `threshold_percent`.
    ///
    /// Notifier failures are logged and returned as `AlertFailed`, never as
    /// errors.
    pub async fn check_and_alert(
        &self,
        sample: &StorageSample,
        threshold_percent: f64,
    ) -> AlertOutcome {
        if sample.usage_percent <= threshold_percent {
            return AlertOutcome::NoAlert;
        }

        warn!(
            "Storage usage {:.1}% is above threshold {:.1}%",
            sample.usage_percent, threshold_percent
        );
        let message = storage_alert(sample, threshold_percent);
        match tokio::time::timeout(self.notify_timeout, self.notifier.send(&message)).await {
            Ok(Ok(())) => {
                info!("Storage alert sent");
                AlertOutcome::AlertSent
            }
            Ok(Err(e)) => {
                warn!("Failed to send storage alert: {}", e);
                AlertOutcome::AlertFailed(e.to_string())
            }
            Err(_) => {
                warn!("Storage alert timed out after {:?}", self.notify_timeout);
                AlertOutcome::AlertFailed("timed out".to_string())
            }
        }
    }

    /// Sample and check against the configured threshold, unless the last
    /// check was less than `check_interval` ago.
    ///
    /// Returns `None` when throttled.
    pub async fn maybe_check(&self) -> Option<Result<(StorageSample, AlertOutcome), TrackerError>> {
        {
            let mut last_check = self.last_check.lock().await;
            if let (Some(interval), Some(last)) = (self.check_interval, *last_check) {
                if last.elapsed() < interval {
                    return None;
                }
            }
            *last_check = Some(Instant::now());
        }

        let sample = match self.sample_blocking().await {
            Ok(sample) => sample,
            Err(e) => return Some(Err(e)),
        };
        let outcome = self.check_and_alert(&sample, self.threshold_percent).await;
        Some(Ok((sample, outcome)))
    }
}
