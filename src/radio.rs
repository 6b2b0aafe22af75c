//! Preflight check of Bluetooth permission and radio power.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::ble::{BleAdapter, RadioState};
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;

/// Outcome of a readiness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Readiness {
    /// Permission granted and radio on.
    Ready,
    /// The OS denied Bluetooth access.
    PermissionDenied,
    /// The radio is off.
    RadioOff,
    /// The state stayed unknown after the recheck.
    RadioStateUnknown,
}

impl Readiness {
    /// Check if scanning and connecting may proceed.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Convert into a `Result`, mapping failures to their error kinds.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Ready => Ok(()),
            Self::PermissionDenied => Err(Error::PermissionDenied),
            Self::RadioOff => Err(Error::RadioOff),
            Self::RadioStateUnknown => Err(Error::RadioStateUnknown),
        }
    }
}

impl From<RadioState> for Readiness {
    fn from(state: RadioState) -> Self {
        match state {
            RadioState::PoweredOn => Self::Ready,
            RadioState::PoweredOff => Self::RadioOff,
            RadioState::Unauthorized => Self::PermissionDenied,
            RadioState::Unknown => Self::RadioStateUnknown,
        }
    }
}

/// Gate in front of every scan and connect.
///
/// Some stacks report an unknown state for a moment after startup, so an
/// unknown answer is rechecked once after a short wait. Nothing else is
/// retried: permission and power problems need the user.
pub struct RadioGuard {
    adapter: Arc<dyn BleAdapter>,
    scheduler: Arc<dyn Scheduler>,
    recheck_delay: Duration,
}

impl RadioGuard {
    /// Default wait before rechecking an unknown state.
    pub const DEFAULT_RECHECK_DELAY: Duration = Duration::from_millis(500);

    /// Create a guard.
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        scheduler: Arc<dyn Scheduler>,
        recheck_delay: Duration,
    ) -> Self {
        Self {
            adapter,
            scheduler,
            recheck_delay,
        }
    }

    /// Check permission and radio state.
    pub async fn check_ready(&self) -> Readiness {
        let first = self.query().await;
        if first != Readiness::RadioStateUnknown {
            return self.report(first);
        }

        debug!(
            "Radio state unknown, rechecking in {:?}",
            self.recheck_delay
        );
        self.scheduler.after(self.recheck_delay).wait().await;

        let second = self.query().await;
        self.report(second)
    }

    async fn query(&self) -> Readiness {
        match self.adapter.radio_state().await {
            Ok(state) => state.into(),
            Err(e) => {
                warn!("Radio state query failed: {}", e);
                Readiness::RadioStateUnknown
            }
        }
    }

    fn report(&self, readiness: Readiness) -> Readiness {
        if readiness.is_ready() {
            debug!("Radio ready");
        } else {
            info!("Radio not ready: {:?}", readiness);
        }
        readiness
    }
}
