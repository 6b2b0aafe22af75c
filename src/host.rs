//! Collaborators supplied by the host application.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data::StepSource;
use crate::error::Result;

/// Host-level aggregated health data, used as the fallback step source.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HealthStore: Send + Sync {
    /// Step total for `date`, or `None` if the store has no data for it.
    ///
    /// An error means the store could not be asked at all.
    async fn daily_step_count(&self, date: NaiveDate) -> Result<Option<u32>>;
}

/// What a telemetry record measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetricKind {
    /// Live heart rate in BPM.
    HeartRate,
    /// Live cumulative step count.
    Steps,
    /// Step total of a calendar day.
    DailySteps,
}

/// One value handed to the rest of the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Owner of the data.
    pub user_id: String,
    /// When the value was measured.
    pub timestamp: DateTime<Utc>,
    /// What the value measures.
    pub metric: MetricKind,
    /// The value.
    pub value: f64,
    /// Where the value came from.
    pub source: StepSource,
}

impl TelemetryRecord {
    /// Create a record.
    pub fn new(
        user_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        metric: MetricKind,
        value: f64,
        source: StepSource,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            timestamp,
            metric,
            value,
            source,
        }
    }
}

/// One-way handoff of samples and sync results. Never queried back.
#[cfg_attr(test, mockall::automock)]
pub trait TelemetrySink: Send + Sync {
    /// Hand off a record.
    fn push(&self, record: TelemetryRecord);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn push(&self, _record: TelemetryRecord) {}
}

/// Sink that logs every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn push(&self, record: TelemetryRecord) {
        info!(
            user = %record.user_id,
            metric = ?record.metric,
            source = %record.source,
            "{} at {}",
            record.value,
            record.timestamp
        );
    }
}
