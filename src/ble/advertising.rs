//! Advertisement data for peripherals seen during a scan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Opaque platform identifier of a peripheral.
///
/// On Linux and Windows this is the Bluetooth address; on macOS it is a
/// per-host UUID assigned by CoreBluetooth.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralId(String);

impl PeripheralId {
    /// Create a new identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A peripheral seen during an active scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeripheral {
    /// Platform identifier.
    pub id: PeripheralId,
    /// Advertised local name.
    pub name: Option<String>,
    /// Advertised service UUIDs.
    pub services: BTreeSet<Uuid>,
    /// Manufacturer-specific data: a little-endian company identifier
    /// followed by the vendor payload.
    pub manufacturer_data: Option<Vec<u8>>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// When this advertisement was received.
    pub discovered_at: DateTime<Utc>,
}

impl DiscoveredPeripheral {
    /// Create an advertisement with only an identifier.
    pub fn new(id: impl Into<PeripheralId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            services: BTreeSet::new(),
            manufacturer_data: None,
            rssi: None,
            discovered_at: Utc::now(),
        }
    }

    /// Set the advertised name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add an advertised service.
    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.services.insert(uuid);
        self
    }

    /// Set the manufacturer data blob.
    pub fn with_manufacturer_data(mut self, data: Vec<u8>) -> Self {
        self.manufacturer_data = Some(data);
        self
    }

    /// Set the signal strength.
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// Set the discovery time.
    pub fn with_discovered_at(mut self, at: DateTime<Utc>) -> Self {
        self.discovered_at = at;
        self
    }

    /// Company identifier from the leading manufacturer-data bytes.
    pub fn company_id(&self) -> Option<u16> {
        match self.manufacturer_data.as_deref() {
            Some([lo, hi, ..]) => Some(u16::from_le_bytes([*lo, *hi])),
            _ => None,
        }
    }

    /// Check if a service is advertised.
    pub fn advertises(&self, uuid: &Uuid) -> bool {
        self.services.contains(uuid)
    }
}

impl From<String> for PeripheralId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Flatten a platform manufacturer-data map into a single blob.
///
/// The entry with the lowest company identifier wins so the result is
/// deterministic; platforms report at most one entry in practice.
pub fn flatten_manufacturer_data(data: &HashMap<u16, Vec<u8>>) -> Option<Vec<u8>> {
    data.iter().min_by_key(|(id, _)| **id).map(|(id, payload)| {
        let mut blob = Vec::with_capacity(payload.len() + 2);
        blob.extend_from_slice(&id.to_le_bytes());
        blob.extend_from_slice(payload);
        blob
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::HEART_RATE_SERVICE_UUID;

    #[test]
    fn test_company_id() {
        let peripheral = DiscoveredPeripheral::new("AA").with_manufacturer_data(vec![0x57, 0x01, 9]);
        assert_eq!(peripheral.company_id(), Some(0x0157));

        let short = DiscoveredPeripheral::new("AA").with_manufacturer_data(vec![0x57]);
        assert_eq!(short.company_id(), None);
        assert_eq!(DiscoveredPeripheral::new("AA").company_id(), None);
    }

    #[test]
    fn test_advertises() {
        let peripheral = DiscoveredPeripheral::new("AA").with_service(HEART_RATE_SERVICE_UUID);
        assert!(peripheral.advertises(&HEART_RATE_SERVICE_UUID));
    }

    #[test]
    fn test_flatten_manufacturer_data() {
        let mut map = HashMap::new();
        map.insert(0x038F_u16, vec![1, 2]);
        map.insert(0x0157_u16, vec![3]);
        assert_eq!(flatten_manufacturer_data(&map), Some(vec![0x57, 0x01, 3]));
        assert_eq!(flatten_manufacturer_data(&HashMap::new()), None);
    }

    #[test]
    fn test_peripheral_id_display() {
        let id = PeripheralId::new("C8:0F:10:AA:BB:CC");
        assert_eq!(id.to_string(), "C8:0F:10:AA:BB:CC");
        assert_eq!(id.as_str(), "C8:0F:10:AA:BB:CC");
    }
}
