//! Telemetry sync pipeline.
//!
//! Reconciles the band's own step count with the host's aggregated health
//! data over a rolling week, persists the result and advances the sync
//! checkpoint only when every date resolved.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ble::PeripheralId;
use crate::config::SyncConfig;
use crate::data::{
    detect_anomalies, AnomalyReport, DailyStepRecord, StepHistory, StepSource, SyncCheckpoint,
};
use crate::error::{Error, Result};
use crate::host::{HealthStore, MetricKind, NullSink, TelemetryRecord, TelemetrySink};
use crate::store::HistoryStore;
use crate::utils::{history_window, Clock, SystemClock};

/// Direct step readings from a connected band.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceStepSource: Send + Sync {
    /// The connected band, or `None` when there is no live session.
    fn device_id(&self) -> Option<PeripheralId>;

    /// Step total the band reports for `date`, if it keeps one.
    ///
    /// Returns [`Error::Cancelled`] as soon as `cancel` fires.
    async fn daily_step_count(
        &self,
        date: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<Option<u32>>;
}

/// Result of a fully successful weekly sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeeklySync {
    /// One record per date, oldest first, ending today.
    pub records: Vec<DailyStepRecord>,
    /// Data-quality findings. Informational only.
    pub anomalies: AnomalyReport,
    /// The checkpoint that was saved.
    pub checkpoint: SyncCheckpoint,
}

/// Marks a sync as running until dropped.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Pulls, reconciles and persists daily step counts.
pub struct TelemetrySyncPipeline {
    device: Option<Arc<dyn DeviceStepSource>>,
    health: Arc<dyn HealthStore>,
    history: HistoryStore,
    sink: Arc<dyn TelemetrySink>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    in_flight: AtomicBool,
}

impl TelemetrySyncPipeline {
    /// Create a pipeline backed by the host health store only.
    pub fn new(health: Arc<dyn HealthStore>, history: HistoryStore, config: SyncConfig) -> Self {
        Self {
            device: None,
            health,
            history,
            sink: Arc::new(NullSink),
            clock: Arc::new(SystemClock),
            config,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Read from `device` whenever it has a live session.
    pub fn with_device(mut self, device: Arc<dyn DeviceStepSource>) -> Self {
        self.device = Some(device);
        self
    }

    /// Hand results to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Use a custom clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Settings in use.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Check if a sync is running.
    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// The persisted checkpoint.
    pub async fn checkpoint(&self) -> Result<SyncCheckpoint> {
        self.history.load_checkpoint().await
    }

    /// The band seen during the last successful sync.
    ///
    /// Pass this to [`crate::ConnectionSupervisor::connect`] to skip
    /// classification of a known band.
    pub async fn known_device_id(&self) -> Result<Option<PeripheralId>> {
        Ok(self.checkpoint().await?.last_known_device_id)
    }

    /// Persisted records of the current week.
    pub async fn stored_history(&self) -> Result<StepHistory> {
        self.history.load_window(self.clock.today()).await
    }

    fn begin(&self) -> Result<InFlight<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::SyncInProgress)?;
        Ok(InFlight(&self.in_flight))
    }

    fn connected_device(&self) -> Option<(&Arc<dyn DeviceStepSource>, PeripheralId)> {
        let device = self.device.as_ref()?;
        let id = device.device_id()?;
        Some((device, id))
    }

    /// Read today's step count from the connected band and persist it.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] without a monitoring session.
    /// - [`Error::SyncInProgress`] while another sync runs.
    /// - [`Error::CharacteristicReadFailed`] or [`Error::Undecodable`] if the
    ///   band did not yield a count.
    pub async fn sync_today(&self) -> Result<TelemetryRecord> {
        let (device, id) = self.connected_device().ok_or(Error::NotConnected)?;
        let _flight = self.begin()?;

        let today = self.clock.today();
        let steps = device
            .daily_step_count(today, &CancellationToken::new())
            .await?
            .ok_or_else(|| Error::CharacteristicReadFailed {
                characteristic: "step-count".to_string(),
            })?;

        let record = DailyStepRecord::new(today, steps, StepSource::Device);
        self.history
            .save_record(&record, Some(self.config.record_ttl))
            .await?;

        let sample = TelemetryRecord::new(
            self.config.user_id.clone(),
            self.clock.now(),
            MetricKind::Steps,
            steps as f64,
            StepSource::Device,
        );
        self.sink.push(sample.clone());

        info!("Synced {} steps for {} from {}", steps, today, id);
        Ok(sample)
    }

    /// Sync the 7 days ending today.
    ///
    /// Each date is taken from the band when connected and otherwise from the
    /// host health store. Every resolved date is persisted, replacing any
    /// earlier record. The checkpoint only advances when all 7 dates resolved.
    ///
    /// # Errors
    ///
    /// - [`Error::SyncInProgress`] while another sync runs.
    /// - [`Error::Cancelled`] if `cancel` fired, including during a band or
    ///   host read; dates resolved so far stay persisted.
    /// - [`Error::SyncPartialFailure`] naming the dates that failed, with the
    ///   anomalies found in the records that were persisted.
    pub async fn sync_weekly_history(&self, cancel: &CancellationToken) -> Result<WeeklySync> {
        let _flight = self.begin()?;

        let today = self.clock.today();
        let device = self.connected_device();
        info!(
            "Syncing week ending {} ({})",
            today,
            if device.is_some() {
                "device connected"
            } else {
                "host only"
            }
        );

        let mut history = StepHistory::new();
        let mut failed_dates = Vec::new();

        for date in history_window(today) {
            if cancel.is_cancelled() {
                info!("Weekly sync cancelled at {}", date);
                return Err(Error::Cancelled);
            }

            let device = device.as_ref().map(|(d, _)| *d);
            let record = match self.resolve(date, device, cancel).await {
                Ok(record) => record,
                Err(Error::Cancelled) => {
                    info!("Weekly sync cancelled at {}", date);
                    return Err(Error::Cancelled);
                }
                Err(e) => {
                    warn!("No step count for {}: {}", date, e);
                    failed_dates.push(date);
                    continue;
                }
            };

            match self
                .history
                .save_record(&record, Some(self.config.record_ttl))
                .await
            {
                Ok(()) => history.insert(record),
                Err(e) => {
                    warn!("Failed to persist {}: {}", date, e);
                    failed_dates.push(date);
                }
            }
        }

        if cancel.is_cancelled() {
            info!("Weekly sync cancelled after {} record(s)", history.len());
            return Err(Error::Cancelled);
        }

        let records = history.records();
        let anomalies = detect_anomalies(&records, self.config.sentinel_steps);
        for anomaly in anomalies.anomalies() {
            warn!(
                "{:?} step count {} on {}",
                anomaly.flag, anomaly.steps, anomaly.date
            );
        }
        self.publish(&records);

        if !failed_dates.is_empty() {
            return Err(Error::SyncPartialFailure {
                failed_dates,
                persisted: records.len(),
                anomalies,
            });
        }

        let previous = self.history.load_checkpoint().await.unwrap_or_default();
        let checkpoint = SyncCheckpoint {
            last_successful_sync: Some(self.clock.now()),
            last_known_device_id: device
                .map(|(_, id)| id)
                .or(previous.last_known_device_id),
        };
        self.history.save_checkpoint(&checkpoint).await?;

        info!("Weekly sync complete: {} steps", history.total_steps());
        Ok(WeeklySync {
            records,
            anomalies,
            checkpoint,
        })
    }

    /// Resolve one date, preferring the band over the host store.
    ///
    /// Only a host store failure or cancellation is an error; a band failure
    /// falls back.
    async fn resolve(
        &self,
        date: NaiveDate,
        device: Option<&Arc<dyn DeviceStepSource>>,
        cancel: &CancellationToken,
    ) -> Result<DailyStepRecord> {
        if let Some(device) = device {
            match device.daily_step_count(date, cancel).await {
                Ok(Some(steps)) => return Ok(DailyStepRecord::resolve(date, Some(steps), None)),
                Ok(None) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => debug!("Band read for {} failed, using host store: {}", date, e),
            }
        }

        let host = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            host = self.health.daily_step_count(date) => host?,
        };
        Ok(DailyStepRecord::resolve(date, None, host))
    }

    fn publish(&self, records: &[DailyStepRecord]) {
        for record in records.iter().filter(|r| r.source != StepSource::None) {
            self.sink.push(TelemetryRecord::new(
                self.config.user_id.clone(),
                start_of_day(record.date),
                MetricKind::DailySteps,
                record.steps as f64,
                record.source,
            ));
        }
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}
