//! Characteristic samples delivered by the supervisor.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::ble::uuids::{BATTERY_LEVEL_UUID, HEART_RATE_MEASUREMENT_UUID, STEP_COUNT_UUID};
use crate::protocol::{
    decode_battery_level, decode_heart_rate, decode_step_count, DecodeFailure, Decoded,
    HeartRateMeasurement, StepLayout,
};

/// Which characteristic a sample came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicKind {
    /// Heart Rate Measurement (0x2A37).
    HeartRate,
    /// Vendor step count.
    StepCount,
    /// Any other characteristic.
    Other(Uuid),
}

impl CharacteristicKind {
    /// The characteristic UUID.
    pub fn uuid(&self) -> Uuid {
        match self {
            Self::HeartRate => HEART_RATE_MEASUREMENT_UUID,
            Self::StepCount => STEP_COUNT_UUID,
            Self::Other(uuid) => *uuid,
        }
    }

    /// Map a characteristic UUID to its kind.
    pub fn from_uuid(uuid: Uuid) -> Self {
        if uuid == HEART_RATE_MEASUREMENT_UUID {
            Self::HeartRate
        } else if uuid == STEP_COUNT_UUID {
            Self::StepCount
        } else {
            Self::Other(uuid)
        }
    }
}

impl std::fmt::Display for CharacteristicKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HeartRate => write!(f, "heart-rate"),
            Self::StepCount => write!(f, "step-count"),
            Self::Other(uuid) => write!(f, "{}", uuid),
        }
    }
}

/// Decoded content of a sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleValue {
    /// Heart rate measurement.
    HeartRate(HeartRateMeasurement),
    /// Cumulative step count.
    Steps(u32),
    /// Battery level in percent.
    BatteryLevel(u8),
    /// A characteristic without a decoder; see the raw bytes.
    Raw,
    /// The payload was malformed.
    Undecodable(DecodeFailure),
}

impl SampleValue {
    fn from_decoded<T>(decoded: Decoded<T>, wrap: impl FnOnce(T) -> Self) -> Self {
        match decoded {
            Decoded::Value(v) => wrap(v),
            Decoded::Undecodable(e) => Self::Undecodable(e),
        }
    }
}

/// One value read or received from the band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicSample {
    /// Source characteristic.
    pub kind: CharacteristicKind,
    /// Payload as received.
    pub raw: Bytes,
    /// Decoded value.
    pub value: SampleValue,
    /// When the payload arrived.
    pub timestamp: DateTime<Utc>,
}

impl CharacteristicSample {
    /// Decode `raw` for `kind`.
    ///
    /// Malformed payloads produce a sample whose value is
    /// [`SampleValue::Undecodable`]; the raw bytes are kept either way.
    pub fn decode(
        kind: CharacteristicKind,
        raw: impl Into<Bytes>,
        layout: &StepLayout,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let raw = raw.into();
        let value = match kind {
            CharacteristicKind::HeartRate => {
                SampleValue::from_decoded(decode_heart_rate(&raw), SampleValue::HeartRate)
            }
            CharacteristicKind::StepCount => {
                SampleValue::from_decoded(decode_step_count(&raw, layout), SampleValue::Steps)
            }
            CharacteristicKind::Other(uuid) if uuid == BATTERY_LEVEL_UUID => {
                SampleValue::from_decoded(decode_battery_level(&raw), SampleValue::BatteryLevel)
            }
            CharacteristicKind::Other(_) => SampleValue::Raw,
        };

        Self {
            kind,
            raw,
            value,
            timestamp,
        }
    }

    /// Check if the payload was malformed.
    pub fn is_undecodable(&self) -> bool {
        matches!(self.value, SampleValue::Undecodable(_))
    }

    /// Heart rate in BPM, if this is a heart-rate sample.
    pub fn heart_rate(&self) -> Option<u16> {
        match &self.value {
            SampleValue::HeartRate(m) => Some(m.bpm),
            _ => None,
        }
    }

    /// Step count, if this is a step sample.
    pub fn steps(&self) -> Option<u32> {
        match self.value {
            SampleValue::Steps(steps) => Some(steps),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_kind_uuid_mapping() {
        for kind in [CharacteristicKind::HeartRate, CharacteristicKind::StepCount] {
            assert_eq!(CharacteristicKind::from_uuid(kind.uuid()), kind);
        }
        assert_eq!(
            CharacteristicKind::from_uuid(BATTERY_LEVEL_UUID),
            CharacteristicKind::Other(BATTERY_LEVEL_UUID)
        );
    }

    #[test]
    fn test_heart_rate_sample() {
        let sample = CharacteristicSample::decode(
            CharacteristicKind::HeartRate,
            vec![0x00, 0x4B],
            &StepLayout::default(),
            now(),
        );
        assert_eq!(sample.heart_rate(), Some(75));
        assert_eq!(sample.raw.as_ref(), &[0x00, 0x4B]);
        assert_eq!(sample.timestamp, now());
    }

    #[test]
    fn test_step_sample() {
        let sample = CharacteristicSample::decode(
            CharacteristicKind::StepCount,
            vec![0x0C, 0x10, 0x27, 0x00, 0x00],
            &StepLayout::default(),
            now(),
        );
        assert_eq!(sample.steps(), Some(10_000));
    }

    #[test]
    fn test_malformed_payload_keeps_raw() {
        let sample = CharacteristicSample::decode(
            CharacteristicKind::HeartRate,
            vec![0x00],
            &StepLayout::default(),
            now(),
        );
        assert!(sample.is_undecodable());
        assert_eq!(sample.heart_rate(), None);
        assert_eq!(sample.raw.len(), 1);
    }

    #[test]
    fn test_battery_and_raw() {
        let battery = CharacteristicSample::decode(
            CharacteristicKind::Other(BATTERY_LEVEL_UUID),
            vec![87],
            &StepLayout::default(),
            now(),
        );
        assert_eq!(battery.value, SampleValue::BatteryLevel(87));

        let other = CharacteristicSample::decode(
            CharacteristicKind::Other(Uuid::nil()),
            vec![1, 2, 3],
            &StepLayout::default(),
            now(),
        );
        assert_eq!(other.value, SampleValue::Raw);
    }
}
