//! Daily step history data structures.
//!
//! Contains the per-day step records written by the sync pipeline, the sync
//! checkpoint, and the anomaly flags raised over a synced week.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::ble::PeripheralId;

/// Where a daily step count came from.
///
/// Ordered by priority: a device reading beats the host aggregate, which
/// beats no data.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum StepSource {
    /// No source had data for the date.
    #[default]
    None,
    /// The host's aggregated health store.
    HostAggregate,
    /// Read directly from the band.
    Device,
}

impl std::fmt::Display for StepSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::HostAggregate => write!(f, "host-aggregate"),
            Self::Device => write!(f, "device"),
        }
    }
}

/// Step total for one calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DailyStepRecord {
    /// Calendar date.
    pub date: NaiveDate,
    /// Steps counted that day.
    pub steps: u32,
    /// Where the count came from.
    pub source: StepSource,
}

impl DailyStepRecord {
    /// Create a new record.
    pub fn new(date: NaiveDate, steps: u32, source: StepSource) -> Self {
        Self {
            date,
            steps,
            source,
        }
    }

    /// Record for a date no source had data for.
    pub fn empty(date: NaiveDate) -> Self {
        Self::new(date, 0, StepSource::None)
    }

    /// Resolve a date from the available readings, highest priority first.
    pub fn resolve(date: NaiveDate, device: Option<u32>, host: Option<u32>) -> Self {
        match (device, host) {
            (Some(steps), _) => Self::new(date, steps, StepSource::Device),
            (None, Some(steps)) => Self::new(date, steps, StepSource::HostAggregate),
            (None, None) => Self::empty(date),
        }
    }
}

/// Progress marker of the sync pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    /// End of the last fully successful weekly sync.
    pub last_successful_sync: Option<DateTime<Utc>>,
    /// The band seen during that sync, used to skip classification next time.
    pub last_known_device_id: Option<PeripheralId>,
}

/// Step history keyed by date.
///
/// Inserting a record for a date that is already present replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepHistory {
    records: BTreeMap<NaiveDate, DailyStepRecord>,
}

impl StepHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the record for its date.
    pub fn insert(&mut self, record: DailyStepRecord) {
        self.records.insert(record.date, record);
    }

    /// Get the record for a date.
    pub fn get(&self, date: NaiveDate) -> Option<&DailyStepRecord> {
        self.records.get(&date)
    }

    /// Number of dates held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the history is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in date order.
    pub fn records(&self) -> Vec<DailyStepRecord> {
        self.records.values().copied().collect()
    }

    /// Dates of `window` with no record.
    pub fn missing_dates(&self, window: &[NaiveDate]) -> Vec<NaiveDate> {
        window
            .iter()
            .filter(|date| !self.records.contains_key(date))
            .copied()
            .collect()
    }

    /// Sum of all held step counts.
    pub fn total_steps(&self) -> u64 {
        self.records.values().map(|r| r.steps as u64).sum()
    }
}

impl FromIterator<DailyStepRecord> for StepHistory {
    fn from_iter<I: IntoIterator<Item = DailyStepRecord>>(iter: I) -> Self {
        let mut history = Self::new();
        for record in iter {
            history.insert(record);
        }
        history
    }
}

/// Kind of data-quality problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AnomalyFlag {
    /// The same nonzero count appears on two or more dates.
    Duplicate,
    /// The count equals the stuck-sensor sentinel.
    Suspicious,
}

/// One flagged date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anomaly {
    /// Flagged date.
    pub date: NaiveDate,
    /// Step count on that date.
    pub steps: u32,
    /// What is wrong with it.
    pub flag: AnomalyFlag,
}

/// Data-quality findings over a set of records. Informational only.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnomalyReport {
    anomalies: Vec<Anomaly>,
}

impl AnomalyReport {
    /// All findings, ordered by date then flag.
    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    /// Check if nothing was flagged.
    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty()
    }

    /// Flags raised for `date`.
    pub fn flags_for(&self, date: NaiveDate) -> Vec<AnomalyFlag> {
        self.anomalies
            .iter()
            .filter(|a| a.date == date)
            .map(|a| a.flag)
            .collect()
    }

    /// Dates carrying `flag`.
    pub fn dates_with(&self, flag: AnomalyFlag) -> Vec<NaiveDate> {
        self.anomalies
            .iter()
            .filter(|a| a.flag == flag)
            .map(|a| a.date)
            .collect()
    }
}

/// Flag duplicate and sentinel step counts.
///
/// Any nonzero count seen on at least two distinct dates marks each of those
/// dates as [`AnomalyFlag::Duplicate`]. A count equal to `sentinel` marks its
/// date as [`AnomalyFlag::Suspicious`], even when it occurs once.
pub fn detect_anomalies(records: &[DailyStepRecord], sentinel: u32) -> AnomalyReport {
    let mut dates_by_value: HashMap<u32, Vec<NaiveDate>> = HashMap::new();
    for record in records {
        let dates = dates_by_value.entry(record.steps).or_default();
        if !dates.contains(&record.date) {
            dates.push(record.date);
        }
    }

    let mut anomalies = Vec::new();
    for record in records {
        let repeated = dates_by_value
            .get(&record.steps)
            .map(|dates| dates.len() >= 2)
            .unwrap_or(false);

        if record.steps != 0 && repeated {
            anomalies.push(Anomaly {
                date: record.date,
                steps: record.steps,
                flag: AnomalyFlag::Duplicate,
            });
        }
        if record.steps == sentinel {
            anomalies.push(Anomaly {
                date: record.date,
                steps: record.steps,
                flag: AnomalyFlag::Suspicious,
            });
        }
    }

    anomalies.sort_by_key(|a| (a.date, a.flag));
    anomalies.dedup();

    AnomalyReport { anomalies }
}
