//! Heart Rate Measurement parsing.
//!
//! Layout of the standard Heart Rate Measurement characteristic (0x2A37):
//! - Byte 0: Flags
//!   - Bit 0: Value format (0 = UINT8, 1 = UINT16 little-endian)
//!   - Bits 1-2: Sensor contact status
//!   - Bit 3: Energy Expended field present (UINT16, kJ)
//!   - Bit 4: RR-Interval fields present (UINT16 each, 1/1024 s)
//! - Bytes 1..: Heart rate value, then optional fields in flag order.

use tracing::debug;

use super::{require_len, DecodeFailure, Decoded};

const FLAG_VALUE_U16: u8 = 0x01;
const FLAG_CONTACT_SUPPORTED: u8 = 0x04;
const FLAG_CONTACT_DETECTED: u8 = 0x02;
const FLAG_ENERGY_PRESENT: u8 = 0x08;
const FLAG_RR_PRESENT: u8 = 0x10;

/// Sensor contact status reported by the band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SensorContact {
    /// The band does not report contact status.
    #[default]
    NotSupported,
    /// Skin contact is detected.
    Detected,
    /// Skin contact is not detected.
    NotDetected,
}

impl SensorContact {
    fn from_flags(flags: u8) -> Self {
        if flags & FLAG_CONTACT_SUPPORTED == 0 {
            Self::NotSupported
        } else if flags & FLAG_CONTACT_DETECTED != 0 {
            Self::Detected
        } else {
            Self::NotDetected
        }
    }
}

/// A decoded heart rate measurement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeartRateMeasurement {
    /// Beats per minute.
    pub bpm: u16,
    /// Skin contact status.
    pub sensor_contact: SensorContact,
    /// Accumulated energy expended in kilojoules, if reported.
    pub energy_expended_kj: Option<u16>,
    /// RR intervals in 1/1024 second units.
    pub rr_intervals: Vec<u16>,
}

impl HeartRateMeasurement {
    /// RR intervals converted to milliseconds.
    pub fn rr_intervals_ms(&self) -> Vec<f64> {
        self.rr_intervals
            .iter()
            .map(|rr| *rr as f64 * 1000.0 / 1024.0)
            .collect()
    }
}

/// Decode a Heart Rate Measurement payload.
///
/// Returns [`Decoded::Undecodable`] when the payload ends before a field the
/// flags byte declares. A trailing odd byte in the RR section is ignored.
pub fn decode_heart_rate(data: &[u8]) -> Decoded<HeartRateMeasurement> {
    match parse(data) {
        Ok(measurement) => Decoded::Value(measurement),
        Err(failure) => {
            debug!(
                "Undecodable heart rate payload {:02X?}: {}",
                &data[..data.len().min(20)],
                failure
            );
            Decoded::Undecodable(failure)
        }
    }
}

fn parse(data: &[u8]) -> Result<HeartRateMeasurement, DecodeFailure> {
    require_len(data, 1)?;
    let flags = data[0];
    let mut offset = 1;

    let bpm = if flags & FLAG_VALUE_U16 != 0 {
        require_len(data, offset + 2)?;
        let value = u16::from_le_bytes([data[offset], data[offset + 1]]);
        offset += 2;
        value
    } else {
        require_len(data, offset + 1)?;
        let value = data[offset] as u16;
        offset += 1;
        value
    };

    let energy_expended_kj = if flags & FLAG_ENERGY_PRESENT != 0 {
        require_len(data, offset + 2)?;
        let value = u16::from_le_bytes([data[offset], data[offset + 1]]);
        offset += 2;
        Some(value)
    } else {
        None
    };

    let rr_intervals = if flags & FLAG_RR_PRESENT != 0 {
        data[offset..]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect()
    } else {
        Vec::new()
    };

    Ok(HeartRateMeasurement {
        bpm,
        sensor_contact: SensorContact::from_flags(flags),
        energy_expended_kj,
        rr_intervals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_uint8_value() {
        let decoded = decode_heart_rate(&[0x00, 0x4B]);
        assert_eq!(decoded.value().map(|m| m.bpm), Some(75));
    }

    #[test]
    fn test_uint16_value() {
        let decoded = decode_heart_rate(&[0x01, 0x2C, 0x01]);
        assert_eq!(decoded.value().map(|m| m.bpm), Some(300));
    }

    #[test]
    fn test_uint16_flag_with_one_byte_is_undecodable() {
        let decoded = decode_heart_rate(&[0x01, 0x4B]);
        assert_eq!(
            decoded,
            Decoded::Undecodable(DecodeFailure::TooShort {
                needed: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_empty_payload() {
        assert!(decode_heart_rate(&[]).is_undecodable());
        assert!(decode_heart_rate(&[0x00]).is_undecodable());
    }

    #[test]
    fn test_full_measurement() {
        // u8 value, contact supported+detected, energy, two RR intervals
        let data = [0x1E, 0x48, 0x10, 0x00, 0x00, 0x04, 0x00, 0x02];
        let decoded = decode_heart_rate(&data).value().unwrap();
        assert_eq!(
            decoded,
            HeartRateMeasurement {
                bpm: 72,
                sensor_contact: SensorContact::Detected,
                energy_expended_kj: Some(16),
                rr_intervals: vec![1024, 512],
            }
        );
        assert_eq!(decoded.rr_intervals_ms(), vec![1000.0, 500.0]);
    }

    #[test]
    fn test_missing_energy_field() {
        let data = [0x08, 0x48, 0x10];
        assert!(decode_heart_rate(&data).is_undecodable());
    }

    #[test]
    fn test_contact_not_detected() {
        let decoded = decode_heart_rate(&[0x04, 0x50]).value().unwrap();
        assert_eq!(decoded.sensor_contact, SensorContact::NotDetected);
    }

    #[test]
    fn test_odd_rr_tail_ignored() {
        let decoded = decode_heart_rate(&[0x10, 0x50, 0x00, 0x04, 0x01])
            .value()
            .unwrap();
        assert_eq!(decoded.rr_intervals, vec![1024]);
    }

    proptest! {
        #[test]
        fn prop_never_panics(data in proptest::collection::vec(any::<u8>(), 0..32)) {
            let _ = decode_heart_rate(&data);
        }

        #[test]
        fn prop_short_u16_payload_is_undecodable(flags in any::<u8>(), byte in any::<u8>()) {
            let flags = flags | FLAG_VALUE_U16;
            prop_assert!(decode_heart_rate(&[flags, byte]).is_undecodable());
        }
    }
}
