//! Battery Level parsing (standard GATT 0x2A19).

use tracing::debug;

use super::{require_len, DecodeFailure, Decoded};

/// Decode a battery level payload into a percentage.
pub fn decode_battery_level(data: &[u8]) -> Decoded<u8> {
    let result = require_len(data, 1).and_then(|_| {
        let percent = data[0];
        if percent > 100 {
            Err(DecodeFailure::OutOfRange(percent as u32))
        } else {
            Ok(percent)
        }
    });

    match result {
        Ok(percent) => Decoded::Value(percent),
        Err(failure) => {
            debug!("Undecodable battery payload {:02X?}: {}", data, failure);
            Decoded::Undecodable(failure)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery_level() {
        assert_eq!(decode_battery_level(&[87]), Decoded::Value(87));
        assert!(decode_battery_level(&[]).is_undecodable());
        assert_eq!(
            decode_battery_level(&[101]),
            Decoded::Undecodable(DecodeFailure::OutOfRange(101))
        );
    }
}
