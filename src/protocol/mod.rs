//! Protocol module for decoding characteristic payloads.
//!
//! This module contains the decoders for:
//! - Heart Rate Measurement notifications (standard GATT 0x2A37)
//! - Vendor step-count characteristic
//! - Battery level (standard GATT 0x2A19)
//!
//! Every decoder is total: any byte slice yields either a value or
//! [`Decoded::Undecodable`], never a panic.

pub mod battery;
pub mod heart_rate;
pub mod steps;

pub use battery::decode_battery_level;
pub use heart_rate::{decode_heart_rate, HeartRateMeasurement, SensorContact};
pub use steps::{decode_step_count, StepLayout};

use thiserror::Error;

/// Why a payload could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeFailure {
    /// The payload is shorter than its layout requires.
    #[error("payload too short: {actual} bytes (need at least {needed})")]
    TooShort {
        /// Bytes required by the layout.
        needed: usize,
        /// Bytes actually present.
        actual: usize,
    },

    /// The configured layout cannot describe a valid field.
    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    /// The value is outside the range the characteristic allows.
    #[error("value out of range: {0}")]
    OutOfRange(u32),
}

/// Result of decoding a characteristic payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    /// The payload decoded successfully.
    Value(T),
    /// The payload was malformed.
    Undecodable(DecodeFailure),
}

impl<T> Decoded<T> {
    /// Get the decoded value, if any.
    pub fn value(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            Self::Undecodable(_) => None,
        }
    }

    /// Check if decoding failed.
    pub fn is_undecodable(&self) -> bool {
        matches!(self, Self::Undecodable(_))
    }

    /// Map the decoded value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Decoded<U> {
        match self {
            Self::Value(v) => Decoded::Value(f(v)),
            Self::Undecodable(e) => Decoded::Undecodable(e),
        }
    }

    /// Convert into a `Result`.
    pub fn into_result(self) -> std::result::Result<T, DecodeFailure> {
        match self {
            Self::Value(v) => Ok(v),
            Self::Undecodable(e) => Err(e),
        }
    }
}

/// Check that `data` holds at least `needed` bytes.
pub(crate) fn require_len(data: &[u8], needed: usize) -> std::result::Result<(), DecodeFailure> {
    if data.len() < needed {
        return Err(DecodeFailure::TooShort {
            needed,
            actual: data.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_len() {
        assert!(require_len(&[1, 2], 2).is_ok());
        assert_eq!(
            require_len(&[1], 2),
            Err(DecodeFailure::TooShort {
                needed: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_decoded_helpers() {
        let ok: Decoded<u8> = Decoded::Value(3);
        assert_eq!(ok.clone().map(|v| v * 2), Decoded::Value(6));
        assert_eq!(ok.value(), Some(3));

        let bad: Decoded<u8> = Decoded::Undecodable(DecodeFailure::OutOfRange(200));
        assert!(bad.is_undecodable());
        assert!(bad.into_result().is_err());
    }
}
