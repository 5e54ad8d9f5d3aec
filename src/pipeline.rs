//! Batch ingestion pipeline
//!
//! Resolves the device, runs every raw fix through the retention store,
//! marks the device online once per batch and checks storage pressure.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::{IngestConfig, SpeedConfig},
    directory::DeviceDirectory,
    errors::TrackerError,
    models::RawFix,
    retention::{Accepted, HistoryArchive, RejectReason, RetentionStore, SubmitOutcome},
    storage::{AlertOutcome, StorageMonitor, StorageSample},
};

/// Speed limit in effect for overspeed flagging
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedPolicy {
    enabled: bool,
    limit_kmh: f64,
}

impl SpeedPolicy {
    pub fn new(config: &SpeedConfig) -> Self {
        if config.speed_limit_enabled && config.dynamic_speed_limit {
            // Without per-road limits every fix falls back to the default
            debug!("Dynamic speed limits have no road source, using the default limit");
        }
        Self {
            enabled: config.speed_limit_enabled,
            limit_kmh: config.default_speed_limit_kmh,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            limit_kmh: f64::INFINITY,
        }
    }

    pub fn is_overspeed(&self, speed_kmh: Option<f64>) -> bool {
        self.enabled && speed_kmh.is_some_and(|speed| speed > self.limit_kmh)
    }
}

/// What happened to one fix of a batch
#[derive(Debug, Clone, PartialEq)]
pub enum FixOutcome {
    Accepted { overspeed: bool },
    Rejected(RejectReason),
    /// Not processed because the batch timed out
    Skipped,
}

/// Storage check done after a batch
#[derive(Debug, Clone, PartialEq)]
pub enum StorageCheck {
    Checked {
        sample: StorageSample,
        alert: AlertOutcome,
    },
    /// Sampling is throttled by the check interval
    Throttled,
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub accepted_count: usize,
    /// One entry per raw fix, in input order
    pub outcomes: Vec<FixOutcome>,
    pub timed_out: bool,
    pub storage: StorageCheck,
    pub completed_at: DateTime<Utc>,
}

impl IngestReport {
    pub fn rejected_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome, FixOutcome::Rejected(_)))
            .count()
    }
}

pub struct IngestPipeline {
    directory: Arc<dyn DeviceDirectory>,
    store: Arc<RetentionStore>,
    monitor: Arc<StorageMonitor>,
    archive: Option<Arc<dyn HistoryArchive>>,
    speed: SpeedPolicy,
    batch_timeout: Option<Duration>,
}

impl IngestPipeline {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        store: Arc<RetentionStore>,
        monitor: Arc<StorageMonitor>,
    ) -> Self {
        Self {
            directory,
            store,
            monitor,
            archive: None,
            speed: SpeedPolicy::disabled(),
            batch_timeout: None,
        }
    }

    pub fn archive(mut self, archive: Arc<dyn HistoryArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn speed_policy(mut self, speed: SpeedPolicy) -> Self {
        self.speed = speed;
        self
    }

    pub fn ingest_config(mut self, config: &IngestConfig) -> Self {
        self.batch_timeout = config.batch_timeout;
        self
    }

    pub fn directory(&self) -> &Arc<dyn DeviceDirectory> {
        &self.directory
    }

    pub fn store(&self) -> &Arc<RetentionStore> {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<StorageMonitor> {
        &self.monitor
    }

    /// Ingest one batch of raw fixes for a device.
    ///
    /// Individual fix rejections are reported in the outcome list; only an
    /// unknown device or a directory failure is returned as an error.
    #[instrument(skip(self, raw_fixes), fields(fixes = raw_fixes.len()))]
    pub async fn ingest_batch(
        &self,
        device_id: &str,
        raw_fixes: Vec<RawFix>,
    ) -> Result<IngestReport, TrackerError> {
        if self.directory.resolve(device_id).await?.is_none() {
            return Err(TrackerError::DeviceUnknown(device_id.to_string()));
        }

        let deadline = self.batch_timeout.map(|timeout| Instant::now() + timeout);
        let mut outcomes = Vec::with_capacity(raw_fixes.len());
        let mut last_accepted_at = None;
        let mut timed_out = false;

        for raw in raw_fixes {
            if timed_out || deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                timed_out = true;
                outcomes.push(FixOutcome::Skipped);
                continue;
            }

            let outcome = match raw.into_fix(Utc::now()) {
                None => SubmitOutcome::Rejected(RejectReason::InvalidCoordinates),
                Some(fix) => self.store.submit(device_id, fix),
            };

            match outcome {
                SubmitOutcome::Accepted(accepted) => {
                    let overspeed = self.speed.is_overspeed(accepted.fix.speed);
                    if overspeed {
                        warn!(
                            "Device {} over speed limit: {:.1} km/h",
                            device_id,
                            accepted.fix.speed.unwrap_or_default()
                        );
                    }
                    last_accepted_at = Some(accepted.accepted_at);
                    outcomes.push(FixOutcome::Accepted { overspeed });
                    if let Some(archive) = &self.archive {
                        if !self
                            .archive_fix(archive.as_ref(), device_id, &accepted, deadline)
                            .await
                        {
                            timed_out = true;
                        }
                    }
                }
                SubmitOutcome::Rejected(reason) => {
                    debug!("Fix rejected: {}", reason.as_str());
                    outcomes.push(FixOutcome::Rejected(reason));
                }
            }
        }

        if timed_out {
            warn!("Batch timed out, remaining fixes skipped");
        }

        if let Some(at) = last_accepted_at {
            if let Err(e) = self.directory.mark_online(device_id, at).await {
                warn!("Failed to mark device online: {}", e);
            }
        }

        let storage = self.check_storage().await;
        let accepted_count = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, FixOutcome::Accepted { .. }))
            .count();
        info!("Accepted {} of {} fixes", accepted_count, outcomes.len());

        Ok(IngestReport {
            accepted_count,
            outcomes,
            timed_out,
            storage,
            completed_at: Utc::now(),
        })
    }

    /// Mirror an accepted fix to the archive within the batch deadline.
    ///
    /// Returns `false` if the deadline passed before the write finished. The
    /// fix stays accepted in the store either way.
    async fn archive_fix(
        &self,
        archive: &dyn HistoryArchive,
        device_id: &str,
        accepted: &Accepted,
        deadline: Option<Instant>,
    ) -> bool {
        let write = async {
            match archive.append(device_id, accepted.seq, &accepted.fix).await {
                Ok(()) => archive.trim(device_id, self.store.capacity()).await,
                Err(e) => Err(e),
            }
        };
        let result = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, write).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Archive write for fix {} ran past the batch deadline", accepted.seq);
                    return false;
                }
            },
            None => write.await,
        };
        if let Err(e) = result {
            warn!("Failed to archive fix: {}", e);
        }
        true
    }

    async fn check_storage(&self) -> StorageCheck {
        match self.monitor.maybe_check().await {
            None => StorageCheck::Throttled,
            Some(Ok((sample, alert))) => StorageCheck::Checked { sample, alert },
            Some(Err(e)) => {
                error!("Storage sampling failed: {}", e);
                StorageCheck::Unavailable(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{RetentionConfig, StorageConfig},
        directory::MemoryDirectory,
        models::LocationFix,
        notifier::Notifier,
        retention::ArchivedFix,
        storage::tests::{CountingNotifier, FailingProbe, FixedProbe},
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Harness {
        directory: Arc<MemoryDirectory>,
        store: Arc<RetentionStore>,
        notifier: Arc<CountingNotifier>,
        pipeline: IngestPipeline,
    }

    fn harness_with_probe(usage_percent: f64) -> Harness {
        let directory = Arc::new(MemoryDirectory::with_devices(["D2", "D3"]));
        let store = Arc::new(RetentionStore::new(&RetentionConfig::default()));
        let notifier = Arc::new(CountingNotifier::default());
        let monitor = Arc::new(StorageMonitor::with_probe(
            &StorageConfig::default(),
            notifier.clone() as Arc<dyn Notifier>,
            Box::new(FixedProbe(usage_percent)),
        ));
        let pipeline = IngestPipeline::new(directory.clone(), store.clone(), monitor);
        Harness {
            directory,
            store,
            notifier,
            pipeline,
        }
    }

    fn harness() -> Harness {
        harness_with_probe(40.0)
    }

    fn raw(lat: f64, lng: f64, timestamp: &str) -> RawFix {
        RawFix {
            latitude: Some(lat),
            longitude: Some(lng),
            timestamp: Some(timestamp.to_string()),
            ..Default::default()
        }
    }

    /// In-memory archive; rows are kept in write order
    #[derive(Default)]
    struct RecordingArchive {
        rows: Mutex<Vec<ArchivedFix>>,
        trims: Mutex<Vec<usize>>,
        /// Delay applied to the first append only
        stall: Option<Duration>,
        stalled: AtomicBool,
    }

    impl RecordingArchive {
        fn stalling_first_append(stall: Duration) -> Self {
            Self {
                stall: Some(stall),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl HistoryArchive for RecordingArchive {
        async fn append(
            &self,
            device_id: &str,
            seq: u64,
            fix: &LocationFix,
        ) -> Result<(), TrackerError> {
            if let Some(stall) = self.stall {
                if !self.stalled.swap(true, Ordering::SeqCst) {
                    tokio::time::sleep(stall).await;
                }
            }
            self.rows.lock().push(ArchivedFix {
                device_id: device_id.to_string(),
                seq,
                fix: fix.clone(),
            });
            Ok(())
        }

        async fn trim(&self, device_id: &str, capacity: usize) -> Result<(), TrackerError> {
            self.trims.lock().push(capacity);
            let mut rows = self.rows.lock();
            let mut seqs: Vec<u64> = rows
                .iter()
                .filter(|row| row.device_id == device_id)
                .map(|row| row.seq)
                .collect();
            seqs.sort_unstable_by(|a, b| b.cmp(a));
            seqs.truncate(capacity);
            rows.retain(|row| row.device_id != device_id || seqs.contains(&row.seq));
            Ok(())
        }

        async fn load_all(&self) -> Result<Vec<ArchivedFix>, TrackerError> {
            let mut rows = self.rows.lock().clone();
            rows.sort_by(|a, b| a.device_id.cmp(&b.device_id).then(a.seq.cmp(&b.seq)));
            Ok(rows)
        }
    }

    #[tokio::test]
    async fn unknown_device_is_rejected_without_history() {
        let h = harness();
        let result = h
            .pipeline
            .ingest_batch("D1", vec![raw(31.2304, 121.4737, "2025-03-01T08:00:00")])
            .await;

        assert!(matches!(result, Err(TrackerError::DeviceUnknown(id)) if id == "D1"));
        assert_eq!(h.store.device_count(), 0);
        assert!(h.store.history("D1", None, None).is_empty());
    }

    #[tokio::test]
    async fn duplicate_within_batch_is_dropped() {
        let h = harness();
        let report = h
            .pipeline
            .ingest_batch(
                "D2",
                vec![
                    raw(31.2304, 121.4737, "2025-03-01T08:00:00"),
                    raw(31.23041, 121.47371, "2025-03-01T08:00:01"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.accepted_count, 1);
        assert_eq!(
            report.outcomes,
            vec![
                FixOutcome::Accepted { overspeed: false },
                FixOutcome::Rejected(RejectReason::Duplicate),
            ]
        );
        assert_eq!(h.store.history("D2", None, None).len(), 1);
    }

    #[tokio::test]
    async fn twelve_fixes_keep_last_ten() {
        let h = harness();
        let fixes: Vec<RawFix> = (1..=12)
            .map(|i| {
                raw(
                    31.0 + i as f64 * 0.01,
                    121.0,
                    &format!("2025-03-01T08:{:02}:00", i),
                )
            })
            .collect();

        let report = h.pipeline.ingest_batch("D3", fixes).await.unwrap();
        assert_eq!(report.accepted_count, 12);

        let history = h.store.history("D3", None, None);
        assert_eq!(history.len(), 10);
        assert_eq!(history[0].latitude, 31.0 + 3.0 * 0.01);
        assert_eq!(history[9].latitude, 31.0 + 12.0 * 0.01);
    }

    #[tokio::test]
    async fn invalid_fixes_reduce_count_but_batch_succeeds() {
        let h = harness();
        let report = h
            .pipeline
            .ingest_batch(
                "D2",
                vec![
                    RawFix {
                        latitude: Some(31.0),
                        ..Default::default()
                    },
                    raw(120.0, 0.0, "2025-03-01T08:00:00"),
                    raw(31.0, 121.0, "garbage"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.accepted_count, 1);
        assert_eq!(report.rejected_count(), 2);
        assert_eq!(
            report.outcomes[0],
            FixOutcome::Rejected(RejectReason::InvalidCoordinates)
        );
    }

    #[tokio::test]
    async fn marks_online_only_when_something_was_accepted() {
        let h = harness();
        h.pipeline
            .ingest_batch("D2", vec![raw(95.0, 0.0, "2025-03-01T08:00:00")])
            .await
            .unwrap();
        assert!(h.directory.get("D2").unwrap().last_seen.is_none());

        let before = Utc::now();
        h.pipeline
            .ingest_batch("D2", vec![raw(31.0, 121.0, "2025-03-01T08:00:00")])
            .await
            .unwrap();
        let last_seen = h.directory.get("D2").unwrap().last_seen.unwrap();
        assert!(last_seen >= before);
    }

    #[tokio::test]
    async fn storage_checked_on_every_batch() {
        let h = harness_with_probe(85.0);
        for _ in 0..2 {
            let report = h
                .pipeline
                .ingest_batch("D2", vec![raw(95.0, 0.0, "2025-03-01T08:00:00")])
                .await
                .unwrap();
            assert_eq!(report.accepted_count, 0);
            assert!(matches!(
                report.storage,
                StorageCheck::Checked {
                    alert: AlertOutcome::AlertSent,
                    ..
                }
            ));
        }
        assert_eq!(h.notifier.sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sampling_failure_does_not_fail_batch() {
        let directory = Arc::new(MemoryDirectory::with_devices(["D2"]));
        let store = Arc::new(RetentionStore::new(&RetentionConfig::default()));
        let monitor = Arc::new(StorageMonitor::with_probe(
            &StorageConfig::default(),
            Arc::new(CountingNotifier::default()),
            Box::new(FailingProbe),
        ));
        let pipeline = IngestPipeline::new(directory, store, monitor);

        let report = pipeline
            .ingest_batch("D2", vec![raw(31.0, 121.0, "2025-03-01T08:00:00")])
            .await
            .unwrap();
        assert_eq!(report.accepted_count, 1);
        assert!(matches!(report.storage, StorageCheck::Unavailable(_)));
    }

    #[tokio::test]
    async fn timed_out_batch_keeps_accepted_fixes() {
        let h = harness();
        let pipeline = h.pipeline.ingest_config(&IngestConfig {
            batch_timeout: Some(Duration::ZERO),
        });

        let report = pipeline
            .ingest_batch(
                "D2",
                vec![
                    raw(31.0, 121.0, "2025-03-01T08:00:00"),
                    raw(32.0, 121.0, "2025-03-01T08:01:00"),
                ],
            )
            .await
            .unwrap();
        assert!(report.timed_out);
        assert_eq!(report.outcomes, vec![FixOutcome::Skipped, FixOutcome::Skipped]);
        assert_eq!(report.accepted_count, 0);
        assert!(h.directory.get("D2").unwrap().last_seen.is_none());
    }

    #[tokio::test]
    async fn accepted_fixes_are_archived_and_trimmed() {
        let h = harness();
        let archive = Arc::new(RecordingArchive::default());
        let pipeline = h.pipeline.archive(archive.clone());

        pipeline
            .ingest_batch(
                "D2",
                vec![
                    raw(31.0, 121.0, "2025-03-01T08:00:00"),
                    raw(31.0, 121.0, "2025-03-01T08:00:30"),
                    raw(32.0, 121.0, "2025-03-01T08:01:00"),
                ],
            )
            .await
            .unwrap();

        let rows = archive.rows.lock().clone();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|row| row.device_id == "D2"));
        assert_eq!(rows.iter().map(|row| row.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(*archive.trims.lock(), vec![10, 10]);

        let restored = RetentionStore::new(&RetentionConfig::default());
        assert_eq!(restored.restore_from(archive.as_ref()).await.unwrap(), 2);
        assert_eq!(restored.latest("D2"), h.store.latest("D2"));

        // Numbering carries on from the archive
        match restored.submit("D2", LocationFix::new(40.0, 121.0, Utc::now())) {
            SubmitOutcome::Accepted(accepted) => assert_eq!(accepted.seq, 3),
            other => panic!("expected acceptance, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn overlapping_batches_restore_in_acceptance_order() {
        let h = harness();
        let archive = Arc::new(RecordingArchive::stalling_first_append(
            Duration::from_millis(200),
        ));
        let pipeline = h.pipeline.archive(archive.clone());

        let (first, second) = tokio::join!(
            pipeline.ingest_batch("D2", vec![raw(31.0, 121.0, "2025-03-01T08:00:00")]),
            pipeline.ingest_batch("D2", vec![raw(32.0, 121.0, "2025-03-01T08:01:00")]),
        );
        first.unwrap();
        second.unwrap();

        // The second batch reached the archive first
        let written: Vec<u64> = archive.rows.lock().iter().map(|row| row.seq).collect();
        assert_eq!(written, vec![2, 1]);
        assert_eq!(h.store.latest("D2").unwrap().latitude, 32.0);

        let restored = RetentionStore::new(&RetentionConfig::default());
        restored.restore_from(archive.as_ref()).await.unwrap();
        assert_eq!(restored.latest("D2").unwrap().latitude, 32.0);
        assert_eq!(restored.accepted("D2"), h.store.accepted("D2"));
    }

    #[tokio::test]
    async fn stalled_archive_write_is_bounded_by_batch_timeout() {
        let h = harness();
        let archive = Arc::new(RecordingArchive::stalling_first_append(
            Duration::from_secs(5),
        ));
        let pipeline = h
            .pipeline
            .archive(archive.clone())
            .ingest_config(&IngestConfig {
                batch_timeout: Some(Duration::from_millis(100)),
            });

        let started = Instant::now();
        let report = pipeline
            .ingest_batch(
                "D2",
                vec![
                    raw(31.0, 121.0, "2025-03-01T08:00:00"),
                    raw(32.0, 121.0, "2025-03-01T08:01:00"),
                ],
            )
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(report.timed_out);
        assert_eq!(
            report.outcomes,
            vec![FixOutcome::Accepted { overspeed: false }, FixOutcome::Skipped]
        );
        // Accepted before the deadline, so it stays
        assert_eq!(h.store.accepted("D2").len(), 1);
        assert!(h.directory.get("D2").unwrap().last_seen.is_some());
        assert!(archive.rows.lock().is_empty());
    }

    #[tokio::test]
    async fn overspeed_is_flagged() {
        let h = harness();
        let pipeline = h.pipeline.speed_policy(SpeedPolicy::new(&SpeedConfig::default()));

        let report = pipeline
            .ingest_batch(
                "D2",
                vec![
                    raw(31.0, 121.0, "2025-03-01T08:00:00"),
                    // ~111 km in an hour
                    raw(32.0, 121.0, "2025-03-01T09:00:00"),
                    RawFix {
                        speed: Some(30.0),
                        ..raw(33.0, 121.0, "2025-03-01T09:01:00")
                    },
                ],
            )
            .await
            .unwrap();

        assert_eq!(
            report.outcomes,
            vec![
                FixOutcome::Accepted { overspeed: false },
                FixOutcome::Accepted { overspeed: true },
                FixOutcome::Accepted { overspeed: false },
            ]
        );
    }

    #[test]
    fn speed_policy() {
        let policy = SpeedPolicy::new(&SpeedConfig::default());
        assert!(!policy.is_overspeed(None));
        assert!(!policy.is_overspeed(Some(60.0)));
        assert!(policy.is_overspeed(Some(60.1)));

        let policy = SpeedPolicy::new(&SpeedConfig {
            speed_limit_enabled: false,
            ..Default::default()
        });
        assert!(!policy.is_overspeed(Some(500.0)));
    }
}
