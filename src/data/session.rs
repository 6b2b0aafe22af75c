//! Connection session data structures.
//!
//! Contains the supervisor state machine states and the record of the single
//! live device session.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::ble::{MatchReason, PeripheralId};

/// Why a session attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// No matching band advertised within the scan window.
    ScanTimeout,
    /// The scan could not be started or ended unexpectedly.
    ScanFailed,
    /// Connecting to the candidate failed or timed out.
    ConnectionFailed,
    /// GATT service discovery failed or timed out.
    ServiceDiscoveryFailed,
}

impl FailureReason {
    /// Check if the supervisor retries after this failure.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::ScanTimeout)
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ScanTimeout => write!(f, "ScanTimeout"),
            Self::ScanFailed => write!(f, "ScanFailed"),
            Self::ConnectionFailed => write!(f, "ConnectionFailed"),
            Self::ServiceDiscoveryFailed => write!(f, "ServiceDiscoveryFailed"),
        }
    }
}

/// Supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SupervisorState {
    /// No session.
    #[default]
    Idle,
    /// Scanning for the band.
    Scanning,
    /// A matching advertisement was seen; the scan is stopped.
    CandidateFound,
    /// Connecting to the candidate.
    Connecting,
    /// Discovering GATT services.
    ServiceDiscovery,
    /// Connected; characteristics may be read and monitored.
    Monitoring,
    /// The session was torn down or the link was lost.
    Disconnected,
    /// The attempt failed.
    Failed(FailureReason),
}

impl SupervisorState {
    /// Check if a new session may start from this state.
    ///
    /// A `Failed` session owns no platform resources, so it counts as torn
    /// down.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Idle | Self::Disconnected | Self::Failed(_))
    }

    /// Check if samples can flow.
    pub fn is_monitoring(&self) -> bool {
        matches!(self, Self::Monitoring)
    }

    /// Check if `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: SupervisorState) -> bool {
        use SupervisorState::*;

        match (*self, next) {
            (Idle | Disconnected | Failed(_), Scanning) => true,
            (Scanning, CandidateFound | Idle) => true,
            (Failed(_), Idle) => true,
            (Scanning, Failed(FailureReason::ScanTimeout | FailureReason::ScanFailed)) => true,
            (CandidateFound, Connecting | Idle) => true,
            (Connecting, ServiceDiscovery | Disconnected) => true,
            (Connecting, Failed(FailureReason::ConnectionFailed)) => true,
            (ServiceDiscovery, Monitoring | Disconnected) => true,
            (ServiceDiscovery, Failed(FailureReason::ServiceDiscoveryFailed)) => true,
            (Monitoring, Disconnected) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::CandidateFound => write!(f, "CandidateFound"),
            Self::Connecting => write!(f, "Connecting"),
            Self::ServiceDiscovery => write!(f, "ServiceDiscovery"),
            Self::Monitoring => write!(f, "Monitoring"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Failed(reason) => write!(f, "Failed({})", reason),
        }
    }
}

/// The single device session owned by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSession {
    /// The band, once a candidate was found.
    pub peripheral_id: Option<PeripheralId>,
    /// Current state.
    pub state: SupervisorState,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Most recent failure.
    pub last_error: Option<FailureReason>,
    /// When monitoring began.
    pub connected_at: Option<DateTime<Utc>>,
    /// Why the band was accepted.
    pub match_reasons: Vec<MatchReason>,
    /// Services found by discovery.
    pub services: Vec<Uuid>,
}

impl ConnectionSession {
    /// Create a session that is starting to scan.
    pub fn new() -> Self {
        Self {
            peripheral_id: None,
            state: SupervisorState::Scanning,
            retry_count: 0,
            last_error: None,
            connected_at: None,
            match_reasons: Vec::new(),
            services: Vec::new(),
        }
    }

    /// Check if this session blocks a new one.
    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// How long the session has been monitoring.
    pub fn connected_for(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.connected_at.map(|at| now - at)
    }
}

impl Default for ConnectionSession {
    fn default() -> Self {
        Self::new()
    }
}
