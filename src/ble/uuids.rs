//! BLE Service and Characteristic UUIDs.
//!
//! Contains the UUID constants and company identifiers used to recognise and
//! talk to the band family.

use uuid::Uuid;

// Heart Rate Service (Standard BLE)
/// Standard BLE Heart Rate Service UUID.
pub const HEART_RATE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180d_0000_1000_8000_00805f9b34fb);
/// Heart Rate Measurement characteristic UUID (Notify).
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a37_0000_1000_8000_00805f9b34fb);

// Battery Service (Standard BLE)
/// Standard BLE Battery Service UUID.
pub const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180f_0000_1000_8000_00805f9b34fb);
/// Battery Level characteristic UUID (Read, Notify).
pub const BATTERY_LEVEL_UUID: Uuid = Uuid::from_u128(0x0000_2a19_0000_1000_8000_00805f9b34fb);

// Vendor services
/// Band main service (16-bit 0xFEE0).
pub const BAND_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_fee0_0000_1000_8000_00805f9b34fb);
/// Band authentication service (16-bit 0xFEE1).
pub const BAND_AUTH_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_fee1_0000_1000_8000_00805f9b34fb);
/// Vendor IoT service (16-bit 0xFE95) advertised by newer firmware.
pub const VENDOR_IOT_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_fe95_0000_1000_8000_00805f9b34fb);
/// Band firmware service advertised by older models.
pub const BAND_FIRMWARE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_1530_0000_3512_2118_0009af100700);

/// Realtime step-count characteristic (Read, Notify) in the band main service.
pub const STEP_COUNT_UUID: Uuid = Uuid::from_u128(0x0000_0007_0000_3512_2118_0009af100700);

/// Vendor-family GATT services; any one advertised identifies the band.
pub const VENDOR_SERVICE_UUIDS: [Uuid; 4] = [
    BAND_SERVICE_UUID,
    BAND_AUTH_SERVICE_UUID,
    VENDOR_IOT_SERVICE_UUID,
    BAND_FIRMWARE_SERVICE_UUID,
];

// Bluetooth SIG company identifiers
/// Anhui Huami Information Technology company identifier.
pub const HUAMI_COMPANY_ID: u16 = 0x0157;
/// Xiaomi Inc company identifier.
pub const XIAOMI_COMPANY_ID: u16 = 0x038F;

/// Company identifiers of the band family.
pub const VENDOR_COMPANY_IDS: [u16; 2] = [HUAMI_COMPANY_ID, XIAOMI_COMPANY_ID];

/// Check if a service UUID is one of the vendor-family services.
pub fn is_vendor_service(uuid: &Uuid) -> bool {
    VENDOR_SERVICE_UUIDS.contains(uuid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            HEART_RATE_SERVICE_UUID.to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            BATTERY_SERVICE_UUID.to_string(),
            "0000180f-0000-1000-8000-00805f9b34fb"
        );
        assert!(STEP_COUNT_UUID.to_string().ends_with("0009af100700"));
    }

    #[test]
    fn test_is_vendor_service() {
        assert!(is_vendor_service(&BAND_SERVICE_UUID));
        assert!(is_vendor_service(&VENDOR_IOT_SERVICE_UUID));
        assert!(!is_vendor_service(&HEART_RATE_SERVICE_UUID));
        assert!(!is_vendor_service(&BATTERY_SERVICE_UUID));
    }
}
