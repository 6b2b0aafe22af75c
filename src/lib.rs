// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # fitband-ble
//!
//! A cross-platform Rust library for finding a wrist-worn fitness band over
//! Bluetooth Low Energy, supervising the connection to it, decoding its
//! biometric characteristics, and keeping a rolling week of step counts in
//! sync with the host's health data.
//!
//! ## Features
//!
//! - **Radio Guard**: Check Bluetooth permission and power before touching the radio
//! - **Band Discovery**: Layered heuristics recognise the band across vendor firmware
//! - **Connection Supervision**: One session at a time, with timeouts, retries and cancellation
//! - **Live Samples**: Heart rate and step count notifications as a cancellable stream
//! - **Weekly Sync**: Device or host-aggregate step counts for the last 7 days, with
//!   duplicate and stuck-sensor detection
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fitband_ble::{
//!     BtleplugAdapter, CharacteristicKind, ConnectOutcome, ConnectionSupervisor, Result,
//!     SupervisorConfig,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let adapter = BtleplugAdapter::new()
//!         .await
//!         .map_err(|_| fitband_ble::Error::RadioStateUnknown)?;
//!     let supervisor = ConnectionSupervisor::new(Arc::new(adapter), SupervisorConfig::default());
//!
//!     match supervisor.connect(None, &CancellationToken::new()).await? {
//!         ConnectOutcome::Connected(session) => {
//!             println!("Connected to {:?}", session.peripheral_id);
//!             let mut heart_rate = supervisor.monitor(CharacteristicKind::HeartRate).await?;
//!             while let Some(sample) = heart_rate.next().await {
//!                 println!("Heart rate: {:?}", sample.heart_rate());
//!             }
//!         }
//!         ConnectOutcome::NotFound => println!("No band nearby"),
//!     }
//!
//!     supervisor.disconnect().await
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.

// Public modules
pub mod ble;
pub mod config;
pub mod data;
pub mod error;
pub mod host;
pub mod protocol;
pub mod radio;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod sync;
pub mod utils;

// Re-exports for convenience
pub use config::{SupervisorConfig, SyncConfig};
pub use error::{Error, ErrorCategory, Result};
pub use radio::{RadioGuard, Readiness};
pub use scheduler::{BackoffPolicy, Scheduler, Timer, TimerOutcome, TokioScheduler};
pub use store::{HistoryStore, KeyValueStore, MemoryStore};
pub use supervisor::{ConnectOutcome, ConnectionSupervisor, SampleSubscription, SupervisorBuilder};
pub use sync::{DeviceStepSource, TelemetrySyncPipeline, WeeklySync};
pub use utils::{history_window, Clock, FixedClock, SystemClock, HISTORY_WINDOW_DAYS};

// Re-export commonly used types from submodules
pub use ble::{
    classify, BleAdapter, BtleplugAdapter, ClassifiedCandidate, ClassifierConfig,
    DiscoveredPeripheral, MatchReason, MockBleAdapter, PeripheralId, RadioState,
};
pub use data::{
    AnomalyFlag, AnomalyReport, CharacteristicKind, CharacteristicSample, ConnectionSession,
    DailyStepRecord, FailureReason, SampleValue, StepHistory, StepSource, SupervisorState,
    SyncCheckpoint,
};
pub use host::{HealthStore, MetricKind, NullSink, TelemetryRecord, TelemetrySink, TracingSink};
pub use protocol::{
    decode_battery_level, decode_heart_rate, decode_step_count, DecodeFailure, Decoded,
    HeartRateMeasurement, StepLayout,
};
