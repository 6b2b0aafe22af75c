//! GATT characteristic handling.
//!
//! Provides reading and per-characteristic notification streams for a
//! connected band on the btleplug stack.

use btleplug::api::{Characteristic, Peripheral as _};
use btleplug::platform::Peripheral;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::adapter::{AdapterError, AdapterResult, NotificationStream};

/// Handler for GATT characteristics on a connected peripheral.
pub struct CharacteristicHandler {
    /// The peripheral to communicate with.
    peripheral: Peripheral,
    /// Cached characteristics by UUID.
    characteristics: Arc<RwLock<HashMap<Uuid, Characteristic>>>,
}

impl CharacteristicHandler {
    /// Create a new characteristic handler for a peripheral.
    ///
    /// Note: Services must be discovered before using this handler.
    pub fn new(peripheral: Peripheral) -> Self {
        Self {
            peripheral,
            characteristics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Cache all characteristics and return the discovered service UUIDs.
    pub fn discover_characteristics(&self) -> Vec<Uuid> {
        let services = self.peripheral.services();
        let mut service_uuids = Vec::with_capacity(services.len());

        let mut chars = self.characteristics.write();
        chars.clear();

        for service in services {
            service_uuids.push(service.uuid);
            for characteristic in service.characteristics {
                debug!(
                    "Found characteristic: {} in service {}",
                    characteristic.uuid, service.uuid
                );
                chars.insert(characteristic.uuid, characteristic);
            }
        }

        debug!("Discovered {} characteristics", chars.len());

        service_uuids
    }

    /// Check if a characteristic exists.
    pub fn has_characteristic(&self, uuid: &Uuid) -> bool {
        self.characteristics.read().contains_key(uuid)
    }

    fn characteristic(&self, uuid: &Uuid) -> AdapterResult<Characteristic> {
        self.characteristics
            .read()
            .get(uuid)
            .cloned()
            .ok_or(AdapterError::CharacteristicNotFound(*uuid))
    }

    /// Read a characteristic value.
    pub async fn read(&self, uuid: &Uuid) -> AdapterResult<Vec<u8>> {
        let characteristic = self.characteristic(uuid)?;
        let data = self.peripheral.read(&characteristic).await?;

        trace!("Read {} bytes from characteristic {}", data.len(), uuid);

        Ok(data)
    }

    /// Subscribe to a characteristic and return its notifications only.
    pub async fn subscribe(&self, uuid: &Uuid) -> AdapterResult<NotificationStream> {
        let characteristic = self.characteristic(uuid)?;

        debug!(
            "Subscribing to {}, properties: {:?}",
            uuid, characteristic.properties
        );

        // Open the notification stream first so the first value is not lost.
        let notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&characteristic).await?;

        let wanted = *uuid;
        let stream = notifications.filter_map(move |notification| {
            let value = (notification.uuid == wanted).then_some(notification.value);
            futures::future::ready(value)
        });

        debug!("Successfully subscribed to notifications from {}", uuid);

        Ok(stream.boxed())
    }

    /// Unsubscribe from notifications from a characteristic.
    pub async fn unsubscribe(&self, uuid: &Uuid) -> AdapterResult<()> {
        let characteristic = self.characteristic(uuid)?;
        self.peripheral.unsubscribe(&characteristic).await?;

        debug!("Unsubscribed from notifications from {}", uuid);

        Ok(())
    }
}
