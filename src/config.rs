//! Tunables for the supervisor and sync pipeline.
//!
//! Every struct carries the field-observed defaults and can be loaded from a
//! host's own settings through serde.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ble::ClassifierConfig;
use crate::error::{Error, Result};
use crate::protocol::StepLayout;
use crate::radio::RadioGuard;
use crate::scheduler::BackoffPolicy;

/// Connection supervisor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Advertisement classification.
    pub classifier: ClassifierConfig,
    /// Step-count payload layout.
    pub step_layout: StepLayout,
    /// Delays between session attempts and between read attempts.
    pub backoff: BackoffPolicy,
    /// Scan window of the first attempt.
    pub quick_scan_window: Duration,
    /// Added to the scan window for every retry.
    pub scan_window_increment: Duration,
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// Service discovery timeout.
    pub discovery_timeout: Duration,
    /// Single characteristic read timeout.
    pub read_timeout: Duration,
    /// Wait before rechecking an unknown radio state.
    pub radio_recheck_delay: Duration,
    /// Samples buffered per subscription before the oldest are dropped.
    pub notification_buffer: usize,
    /// Forward monitored samples to the telemetry sink.
    pub forward_samples: bool,
}

impl SupervisorConfig {
    /// Check the settings can drive a session.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidParameter`] naming the first unusable field.
    pub fn validate(&self) -> Result<()> {
        if let Err(failure) = self.step_layout.validate() {
            return Err(invalid("step_layout", failure));
        }
        if self.quick_scan_window.is_zero() {
            return Err(invalid("quick_scan_window", "0s"));
        }
        if self.notification_buffer == 0 {
            return Err(invalid("notification_buffer", 0));
        }
        Ok(())
    }

    /// Scan window for attempt `retry` (0 for the first attempt).
    pub fn scan_window(&self, retry: u32) -> Duration {
        self.quick_scan_window
            .saturating_add(self.scan_window_increment.saturating_mul(retry))
    }

    /// Replace the classifier settings.
    pub fn with_classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.classifier = classifier;
        self
    }

    /// Replace the step layout.
    pub fn with_step_layout(mut self, layout: StepLayout) -> Self {
        self.step_layout = layout;
        self
    }

    /// Replace the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replace the first scan window.
    pub fn with_quick_scan_window(mut self, window: Duration) -> Self {
        self.quick_scan_window = window;
        self
    }

    /// Enable or disable sink forwarding.
    pub fn with_forward_samples(mut self, forward: bool) -> Self {
        self.forward_samples = forward;
        self
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            classifier: ClassifierConfig::default(),
            step_layout: StepLayout::default(),
            backoff: BackoffPolicy::default(),
            quick_scan_window: Duration::from_secs(10),
            scan_window_increment: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(15),
            discovery_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5),
            radio_recheck_delay: RadioGuard::DEFAULT_RECHECK_DELAY,
            notification_buffer: 64,
            forward_samples: true,
        }
    }
}

fn invalid(name: &str, value: impl std::fmt::Display) -> Error {
    Error::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}

/// Sync pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Owner of the synced data, passed to the telemetry sink.
    pub user_id: String,
    /// Step value the band reports when its sensor is stuck.
    pub sentinel_steps: u32,
    /// How long persisted daily records are kept.
    pub record_ttl: Duration,
}

impl SyncConfig {
    /// Default stuck-sensor reading.
    pub const DEFAULT_SENTINEL_STEPS: u32 = 65_535;

    /// Create settings for `user_id`.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    /// Replace the sentinel value.
    pub fn with_sentinel_steps(mut self, sentinel: u32) -> Self {
        self.sentinel_steps = sentinel;
        self
    }

    /// Replace the record TTL.
    pub fn with_record_ttl(mut self, ttl: Duration) -> Self {
        self.record_ttl = ttl;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            sentinel_steps: Self::DEFAULT_SENTINEL_STEPS,
            // One day beyond the window so yesterday's sync survives until
            // the next one.
            record_ttl: Duration::from_secs(8 * 24 * 60 * 60),
        }
    }
}
