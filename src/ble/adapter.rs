//! Platform BLE capability consumed by the supervisor.
//!
//! [`BleAdapter`] is the only way the crate touches the radio. The production
//! implementation is [`crate::ble::BtleplugAdapter`]; tests and hosts without
//! a radio use [`crate::ble::MockBleAdapter`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use uuid::Uuid;

use crate::ble::advertising::{DiscoveredPeripheral, PeripheralId};

/// Stream of advertisements produced by an active scan.
pub type PeripheralStream = BoxStream<'static, DiscoveredPeripheral>;

/// Stream of raw characteristic notifications.
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// Power and authorization state of the local radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioState {
    /// Powered on and usable.
    PoweredOn,
    /// Switched off.
    PoweredOff,
    /// The OS denied access.
    Unauthorized,
    /// Not yet known (common right after startup).
    Unknown,
}

/// Optional narrowing of a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only report peripherals advertising one of these services.
    /// Empty means report everything.
    pub services: Vec<Uuid>,
}

/// Low-level adapter failure.
///
/// Never returned to callers of the supervisor or the sync pipeline.
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Error from the btleplug stack.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// No Bluetooth adapter is present.
    #[error("No Bluetooth adapter available")]
    NoAdapter,

    /// The peripheral is not known to the adapter.
    #[error("Peripheral not found: {0}")]
    PeripheralNotFound(PeripheralId),

    /// The characteristic was not discovered on the peripheral.
    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    /// The peripheral is not connected.
    #[error("Peripheral not connected")]
    NotConnected,

    /// Any other platform failure.
    #[error("{0}")]
    Other(String),
}

/// Result type for adapter operations.
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// The BLE operations the supervisor requires from the platform.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Current radio state.
    async fn radio_state(&self) -> AdapterResult<RadioState>;

    /// Start scanning. Advertisements arrive on the returned stream until
    /// [`BleAdapter::stop_scan`] is called.
    async fn start_scan(&self, filter: ScanFilter) -> AdapterResult<PeripheralStream>;

    /// Stop scanning. Stopping an idle scanner is not an error.
    async fn stop_scan(&self) -> AdapterResult<()>;

    /// Connect to a peripheral.
    async fn connect(&self, id: &PeripheralId) -> AdapterResult<()>;

    /// Discover GATT services, returning their UUIDs.
    async fn discover_services(&self, id: &PeripheralId) -> AdapterResult<Vec<Uuid>>;

    /// Read a characteristic value.
    async fn read_characteristic(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
    ) -> AdapterResult<Vec<u8>>;

    /// Subscribe to notifications from a characteristic.
    async fn subscribe_characteristic(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
    ) -> AdapterResult<NotificationStream>;

    /// Unsubscribe from a characteristic. Must tolerate a dropped link.
    async fn unsubscribe_characteristic(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
    ) -> AdapterResult<()>;

    /// Disconnect from a peripheral.
    async fn disconnect(&self, id: &PeripheralId) -> AdapterResult<()>;
}
