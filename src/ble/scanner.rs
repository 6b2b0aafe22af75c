//! BLE scanning on the btleplug stack.
//!
//! Turns btleplug central events into [`DiscoveredPeripheral`] advertisements
//! and remembers the platform handle of every peripheral seen so it can be
//! connected later.

use btleplug::api::{Central, CentralEvent, Peripheral as _, ScanFilter as PlatformScanFilter};
use btleplug::platform::{Adapter, Peripheral};
use chrono::Utc;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::ble::adapter::{AdapterError, AdapterResult, PeripheralStream, ScanFilter};
use crate::ble::advertising::{flatten_manufacturer_data, DiscoveredPeripheral, PeripheralId};

/// BLE scanner over one btleplug adapter.
pub struct BleScanner {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    /// Platform handles of peripherals seen while scanning.
    peripherals: Arc<RwLock<HashMap<PeripheralId, Peripheral>>>,
    /// Whether scanning is currently active.
    is_scanning: Arc<RwLock<bool>>,
}

impl BleScanner {
    /// Create a scanner for a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            is_scanning: Arc::new(RwLock::new(false)),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        *self.is_scanning.read()
    }

    /// Look up the platform handle of a previously seen peripheral.
    pub fn peripheral(&self, id: &PeripheralId) -> AdapterResult<Peripheral> {
        self.peripherals
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| AdapterError::PeripheralNotFound(id.clone()))
    }

    /// Start scanning and return the advertisement stream.
    pub async fn start_scanning(&self, filter: ScanFilter) -> AdapterResult<PeripheralStream> {
        // Subscribe before starting so no early advertisement is missed.
        let events = self.adapter.events().await?;

        info!("Starting BLE scan (service filter: {:?})", filter.services);
        self.adapter
            .start_scan(PlatformScanFilter {
                services: filter.services,
            })
            .await?;
        *self.is_scanning.write() = true;

        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();

        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let peripherals = peripherals.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. }
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => return None,
                };
                Self::process_peripheral(&adapter, &peripherals, id).await
            }
        });

        Ok(stream.boxed())
    }

    /// Stop scanning.
    pub async fn stop_scanning(&self) -> AdapterResult<()> {
        if !*self.is_scanning.read() {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");
        *self.is_scanning.write() = false;
        self.adapter.stop_scan().await?;
        Ok(())
    }

    /// Build an advertisement from a peripheral's current properties.
    async fn process_peripheral(
        adapter: &Adapter,
        peripherals: &Arc<RwLock<HashMap<PeripheralId, Peripheral>>>,
        platform_id: btleplug::platform::PeripheralId,
    ) -> Option<DiscoveredPeripheral> {
        let peripheral = match adapter.peripheral(&platform_id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return None,
        };

        let id = PeripheralId::new(platform_id.to_string());
        peripherals.write().insert(id.clone(), peripheral);

        let discovered = DiscoveredPeripheral {
            id,
            name: properties.local_name,
            services: properties.services.into_iter().collect(),
            manufacturer_data: flatten_manufacturer_data(&properties.manufacturer_data),
            rssi: properties.rssi,
            discovered_at: Utc::now(),
        };

        trace!(
            "Advertisement from {} ({:?}, rssi {:?})",
            discovered.id,
            discovered.name,
            discovered.rssi
        );

        Some(discovered)
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        *self.is_scanning.write() = false;
    }
}
