//! Data structures for band data.
//!
//! This module contains the core data types used to represent the
//! connection session, characteristic samples, and daily step history.

pub mod history;
pub mod sample;
pub mod session;

pub use history::{
    detect_anomalies, Anomaly, AnomalyFlag, AnomalyReport, DailyStepRecord, StepHistory,
    StepSource, SyncCheckpoint,
};
pub use sample::{CharacteristicKind, CharacteristicSample, SampleValue};
pub use session::{ConnectionSession, FailureReason, SupervisorState};
