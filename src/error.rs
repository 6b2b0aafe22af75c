//! Error types for the fitband-ble crate.
//!
//! Low-level adapter failures ([`crate::ble::AdapterError`]) never escape the
//! supervisor or the sync pipeline. They are mapped into one of the variants
//! below, whose messages are safe to show to a user.

use chrono::NaiveDate;
use thiserror::Error;

use crate::data::AnomalyReport;
use crate::protocol::DecodeFailure;

/// The main error type for this crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The OS denied this application access to Bluetooth.
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// The Bluetooth radio is switched off.
    #[error("Bluetooth is turned off")]
    RadioOff,

    /// The radio state could not be determined, even after a recheck.
    #[error("Bluetooth state unknown")]
    RadioStateUnknown,

    /// Scanning could not be started or the scan stream ended unexpectedly.
    #[error("Scan failed after {attempts} attempt(s)")]
    ScanFailed {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// The band was found but a connection could not be established.
    #[error("Connection failed after {attempts} attempt(s)")]
    ConnectionFailed {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// Connected, but GATT service discovery failed.
    #[error("Service discovery failed after {attempts} attempt(s)")]
    ServiceDiscoveryFailed {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// Reading a characteristic failed.
    #[error("Characteristic read failed: {characteristic}")]
    CharacteristicReadFailed {
        /// Name of the characteristic that could not be read.
        characteristic: String,
    },

    /// A payload could not be decoded.
    #[error("Undecodable payload: {0}")]
    Undecodable(DecodeFailure),

    /// Some dates of a weekly sync could not be resolved.
    #[error("Sync partially failed for {} date(s)", failed_dates.len())]
    SyncPartialFailure {
        /// Dates that could not be resolved.
        failed_dates: Vec<NaiveDate>,
        /// Number of records that were persisted anyway.
        persisted: usize,
        /// Data-quality findings over the persisted records.
        anomalies: AnomalyReport,
    },

    /// A session is already active on this supervisor.
    #[error("A device session is already active")]
    SessionActive,

    /// The operation requires a monitoring session.
    #[error("Band not connected")]
    NotConnected,

    /// A sync is already running.
    #[error("Sync already in progress")]
    SyncInProgress,

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// The persistent store failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },
}

/// Actionable category of an error, for choosing user-facing messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The user must grant Bluetooth permission.
    GrantPermission,
    /// The user must switch Bluetooth on.
    EnableBluetooth,
    /// The band could not be reached; retrying later may help.
    DeviceUnreachable,
    /// Data was received but was not usable.
    BadData,
    /// History sync did not fully complete.
    SyncIncomplete,
    /// Caller misuse or cancellation; nothing to show.
    Internal,
}

impl Error {
    /// Get the actionable category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::PermissionDenied => ErrorCategory::GrantPermission,
            Self::RadioOff | Self::RadioStateUnknown => ErrorCategory::EnableBluetooth,
            Self::ScanFailed { .. }
            | Self::ConnectionFailed { .. }
            | Self::ServiceDiscoveryFailed { .. }
            | Self::CharacteristicReadFailed { .. }
            | Self::NotConnected => ErrorCategory::DeviceUnreachable,
            Self::Undecodable(_) => ErrorCategory::BadData,
            Self::SyncPartialFailure { .. } | Self::Storage(_) => ErrorCategory::SyncIncomplete,
            Self::SessionActive
            | Self::SyncInProgress
            | Self::Cancelled
            | Self::InvalidParameter { .. } => ErrorCategory::Internal,
        }
    }

    /// Check if this error is fatal and user-actionable (never retried).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied | Self::RadioOff | Self::RadioStateUnknown
        )
    }

    /// Check if this error belongs to the transient class handled by the
    /// supervisor's retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ScanFailed { .. }
                | Self::ConnectionFailed { .. }
                | Self::ServiceDiscoveryFailed { .. }
                | Self::CharacteristicReadFailed { .. }
        )
    }
}

impl From<DecodeFailure> for Error {
    fn from(failure: DecodeFailure) -> Self {
        Self::Undecodable(failure)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(Error::PermissionDenied.is_fatal());
        assert!(Error::RadioOff.is_fatal());
        assert!(!Error::ConnectionFailed { attempts: 3 }.is_fatal());
        assert!(!Error::Cancelled.is_fatal());
    }

    #[test]
    fn test_transient_errors() {
        assert!(Error::ConnectionFailed { attempts: 1 }.is_transient());
        assert!(Error::ServiceDiscoveryFailed { attempts: 1 }.is_transient());
        assert!(Error::CharacteristicReadFailed {
            characteristic: "steps".to_string()
        }
        .is_transient());
        assert!(!Error::RadioOff.is_transient());
        assert!(!Error::SyncInProgress.is_transient());
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            Error::PermissionDenied.category(),
            ErrorCategory::GrantPermission
        );
        assert_eq!(Error::RadioOff.category(), ErrorCategory::EnableBluetooth);
        assert_eq!(
            Error::ConnectionFailed { attempts: 3 }.category(),
            ErrorCategory::DeviceUnreachable
        );
        assert_eq!(
            Error::SyncPartialFailure {
                failed_dates: vec![],
                persisted: 6,
                anomalies: AnomalyReport::default(),
            }
            .category(),
            ErrorCategory::SyncIncomplete
        );
    }

    #[test]
    fn test_messages_hide_platform_text() {
        let err = Error::ConnectionFailed { attempts: 3 };
        assert_eq!(err.to_string(), "Connection failed after 3 attempt(s)");
    }
}
