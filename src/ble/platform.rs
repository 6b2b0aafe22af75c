//! [`BleAdapter`] implementation on btleplug.

use async_trait::async_trait;
use btleplug::api::{Central, CentralState, Manager as _, Peripheral as _};
use btleplug::platform::Manager;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::adapter::{
    AdapterError, AdapterResult, BleAdapter, NotificationStream, PeripheralStream, RadioState,
    ScanFilter,
};
use crate::ble::advertising::PeripheralId;
use crate::ble::characteristics::CharacteristicHandler;
use crate::ble::scanner::BleScanner;

/// The system Bluetooth adapter, driven through btleplug.
pub struct BtleplugAdapter {
    scanner: BleScanner,
    /// Characteristic handlers of connected peripherals.
    handlers: Arc<RwLock<HashMap<PeripheralId, Arc<CharacteristicHandler>>>>,
}

impl BtleplugAdapter {
    /// Open the first Bluetooth adapter on this system.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> AdapterResult<Self> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters.into_iter().next().ok_or(AdapterError::NoAdapter)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self {
            scanner: BleScanner::with_adapter(adapter),
            handlers: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn handler(&self, id: &PeripheralId) -> AdapterResult<Arc<CharacteristicHandler>> {
        self.handlers
            .read()
            .get(id)
            .cloned()
            .ok_or(AdapterError::NotConnected)
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn radio_state(&self) -> AdapterResult<RadioState> {
        match self.scanner.adapter().adapter_state().await {
            Ok(CentralState::PoweredOn) => Ok(RadioState::PoweredOn),
            Ok(CentralState::PoweredOff) => Ok(RadioState::PoweredOff),
            Ok(_) => Ok(RadioState::Unknown),
            Err(btleplug::Error::PermissionDenied) => Ok(RadioState::Unauthorized),
            Err(e) => Err(e.into()),
        }
    }

    async fn start_scan(&self, filter: ScanFilter) -> AdapterResult<PeripheralStream> {
        self.scanner.start_scanning(filter).await
    }

    async fn stop_scan(&self) -> AdapterResult<()> {
        self.scanner.stop_scanning().await
    }

    async fn connect(&self, id: &PeripheralId) -> AdapterResult<()> {
        let peripheral = self.scanner.peripheral(id)?;

        if peripheral.is_connected().await.unwrap_or(false) {
            info!("Peripheral {} already connected at BLE level", id);
            return Ok(());
        }

        peripheral.connect().await?;
        info!("Connected to {}", id);
        Ok(())
    }

    async fn discover_services(&self, id: &PeripheralId) -> AdapterResult<Vec<Uuid>> {
        let peripheral = self.scanner.peripheral(id)?;
        peripheral.discover_services().await?;

        let handler = CharacteristicHandler::new(peripheral);
        let services = handler.discover_characteristics();
        self.handlers.write().insert(id.clone(), Arc::new(handler));

        debug!("{} exposes {} services", id, services.len());
        Ok(services)
    }

    async fn read_characteristic(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
    ) -> AdapterResult<Vec<u8>> {
        self.handler(id)?.read(&characteristic).await
    }

    async fn subscribe_characteristic(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
    ) -> AdapterResult<NotificationStream> {
        self.handler(id)?.subscribe(&characteristic).await
    }

    async fn unsubscribe_characteristic(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
    ) -> AdapterResult<()> {
        let handler = match self.handler(id) {
            Ok(handler) => handler,
            // Connection already released; nothing left to unsubscribe.
            Err(AdapterError::NotConnected) => return Ok(()),
            Err(e) => return Err(e),
        };

        if let Err(e) = handler.unsubscribe(&characteristic).await {
            warn!("Unsubscribe from {} on {} failed: {}", characteristic, id, e);
        }
        Ok(())
    }

    async fn disconnect(&self, id: &PeripheralId) -> AdapterResult<()> {
        self.handlers.write().remove(id);

        let peripheral = self.scanner.peripheral(id)?;
        if !peripheral.is_connected().await.unwrap_or(false) {
            debug!("{} already disconnected", id);
            return Ok(());
        }

        peripheral.disconnect().await?;
        info!("Disconnected from {}", id);
        Ok(())
    }
}
