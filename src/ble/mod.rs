//! BLE communication module.
//!
//! This module provides the platform seam ([`BleAdapter`]), its btleplug and
//! mock implementations, and the advertisement model and classifier used to
//! find the band.

pub mod adapter;
pub mod advertising;
pub mod characteristics;
pub mod classifier;
pub mod mock;
pub mod platform;
pub mod scanner;
pub mod uuids;

pub use adapter::{
    AdapterError, AdapterResult, BleAdapter, NotificationStream, PeripheralStream, RadioState,
    ScanFilter,
};
pub use advertising::{DiscoveredPeripheral, PeripheralId};
pub use classifier::{classify, ClassifiedCandidate, ClassifierConfig, MatchReason};
pub use mock::MockBleAdapter;
pub use platform::BtleplugAdapter;
pub use uuids::*;
