//! In-process [`BleAdapter`] for tests and radio-less hosts.
//!
//! Advertisements, radio states, failures and notifications are scripted by
//! the caller; every call is counted so tests can assert that scans and
//! subscriptions were released.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use uuid::Uuid;

use crate::ble::adapter::{
    AdapterError, AdapterResult, BleAdapter, NotificationStream, PeripheralStream, RadioState,
    ScanFilter,
};
use crate::ble::advertising::{DiscoveredPeripheral, PeripheralId};
use crate::ble::uuids::{
    BAND_SERVICE_UUID, BATTERY_SERVICE_UUID, HEART_RATE_SERVICE_UUID,
};

#[derive(Default)]
struct MockState {
    radio_states: VecDeque<RadioState>,
    radio_default: Option<RadioState>,
    advertisements: Vec<DiscoveredPeripheral>,
    scan_tx: Option<mpsc::UnboundedSender<DiscoveredPeripheral>>,
    fail_scans: u32,
    fail_connects: u32,
    fail_discoveries: u32,
    fail_reads: u32,
    connect_delay: Option<Duration>,
    services: Vec<Uuid>,
    read_values: HashMap<Uuid, Vec<u8>>,
    connected: HashSet<PeripheralId>,
    subscriptions: HashMap<Uuid, mpsc::UnboundedSender<Vec<u8>>>,
    scans_started: u32,
    connects: u32,
    unsubscribes: u32,
    disconnects: u32,
}

/// Scriptable BLE adapter.
pub struct MockBleAdapter {
    state: Mutex<MockState>,
}

impl MockBleAdapter {
    /// Create a powered-on adapter exposing Heart Rate, Battery and band services.
    pub fn new() -> Self {
        let state = MockState {
            radio_default: Some(RadioState::PoweredOn),
            services: vec![
                HEART_RATE_SERVICE_UUID,
                BATTERY_SERVICE_UUID,
                BAND_SERVICE_UUID,
            ],
            ..MockState::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    /// Set the radio state reported once the queued states are used up.
    pub fn set_radio_state(&self, state: RadioState) {
        self.state.lock().radio_default = Some(state);
    }

    /// Queue a radio state for the next query.
    pub fn push_radio_state(&self, state: RadioState) {
        self.state.lock().radio_states.push_back(state);
    }

    /// Make radio state queries fail once the queue is empty.
    pub fn fail_radio_state(&self) {
        self.state.lock().radio_default = None;
    }

    /// Advertisement delivered at the start of every scan.
    pub fn add_advertisement(&self, peripheral: DiscoveredPeripheral) {
        self.state.lock().advertisements.push(peripheral);
    }

    /// Deliver an advertisement to the running scan.
    pub fn inject_advertisement(&self, peripheral: DiscoveredPeripheral) -> bool {
        match self.state.lock().scan_tx.as_ref() {
            Some(tx) => tx.unbounded_send(peripheral).is_ok(),
            None => false,
        }
    }

    /// Fail the next `count` scan starts.
    pub fn fail_scans(&self, count: u32) {
        self.state.lock().fail_scans = count;
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_connects(&self, count: u32) {
        self.state.lock().fail_connects = count;
    }

    /// Fail the next `count` service discoveries.
    pub fn fail_service_discovery(&self, count: u32) {
        self.state.lock().fail_discoveries = count;
    }

    /// Fail the next `count` characteristic reads.
    pub fn fail_reads(&self, count: u32) {
        self.state.lock().fail_reads = count;
    }

    /// Delay every connection attempt.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = Some(delay);
    }

    /// Services reported by discovery.
    pub fn set_services(&self, services: Vec<Uuid>) {
        self.state.lock().services = services;
    }

    /// Value returned when reading `characteristic`.
    pub fn set_read_value(&self, characteristic: Uuid, value: Vec<u8>) {
        self.state.lock().read_values.insert(characteristic, value);
    }

    /// Emit a notification on a subscribed characteristic.
    pub fn notify(&self, characteristic: Uuid, value: Vec<u8>) -> bool {
        match self.state.lock().subscriptions.get(&characteristic) {
            Some(tx) => tx.unbounded_send(value).is_ok(),
            None => false,
        }
    }

    /// Simulate the band going out of range: connections and notification
    /// streams end.
    pub fn drop_link(&self) {
        let mut state = self.state.lock();
        state.connected.clear();
        state.subscriptions.clear();
    }

    /// Check if a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.state.lock().scan_tx.is_some()
    }

    /// Check if a peripheral is connected.
    pub fn is_connected(&self, id: &PeripheralId) -> bool {
        self.state.lock().connected.contains(id)
    }

    /// Number of live characteristic subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Number of scans started.
    pub fn scan_count(&self) -> u32 {
        self.state.lock().scans_started
    }

    /// Number of connection attempts.
    pub fn connect_count(&self) -> u32 {
        self.state.lock().connects
    }

    /// Number of unsubscribe calls.
    pub fn unsubscribe_count(&self) -> u32 {
        self.state.lock().unsubscribes
    }

    /// Number of disconnect calls.
    pub fn disconnect_count(&self) -> u32 {
        self.state.lock().disconnects
    }
}

impl Default for MockBleAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

#[async_trait]
impl BleAdapter for MockBleAdapter {
    async fn radio_state(&self) -> AdapterResult<RadioState> {
        let mut state = self.state.lock();
        match state.radio_states.pop_front().or(state.radio_default) {
            Some(radio) => Ok(radio),
            None => Err(AdapterError::Other("radio state unavailable".to_string())),
        }
    }

    async fn start_scan(&self, filter: ScanFilter) -> AdapterResult<PeripheralStream> {
        let mut state = self.state.lock();
        if take_failure(&mut state.fail_scans) {
            return Err(AdapterError::Other("scan refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded();
        for peripheral in &state.advertisements {
            let wanted = filter.services.is_empty()
                || filter.services.iter().any(|uuid| peripheral.advertises(uuid));
            if wanted {
                let _ = tx.unbounded_send(peripheral.clone());
            }
        }

        state.scan_tx = Some(tx);
        state.scans_started += 1;
        tracing::info!("MockBleAdapter: started scanning");
        Ok(rx.boxed())
    }

    async fn stop_scan(&self) -> AdapterResult<()> {
        if self.state.lock().scan_tx.take().is_some() {
            tracing::info!("MockBleAdapter: stopped scanning");
        }
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> AdapterResult<()> {
        let delay = {
            let mut state = self.state.lock();
            state.connects += 1;
            state.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if take_failure(&mut state.fail_connects) {
            return Err(AdapterError::Other("connection refused".to_string()));
        }
        state.connected.insert(id.clone());
        Ok(())
    }

    async fn discover_services(&self, id: &PeripheralId) -> AdapterResult<Vec<Uuid>> {
        let mut state = self.state.lock();
        if !state.connected.contains(id) {
            return Err(AdapterError::NotConnected);
        }
        if take_failure(&mut state.fail_discoveries) {
            return Err(AdapterError::Other("GATT discovery failed".to_string()));
        }
        Ok(state.services.clone())
    }

    async fn read_characteristic(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
    ) -> AdapterResult<Vec<u8>> {
        let mut state = self.state.lock();
        if !state.connected.contains(id) {
            return Err(AdapterError::NotConnected);
        }
        if take_failure(&mut state.fail_reads) {
            return Err(AdapterError::Other("read failed".to_string()));
        }
        state
            .read_values
            .get(&characteristic)
            .cloned()
            .ok_or(AdapterError::CharacteristicNotFound(characteristic))
    }

    async fn subscribe_characteristic(
        &self,
        id: &PeripheralId,
        characteristic: Uuid,
    ) -> AdapterResult<NotificationStream> {
        let mut state = self.state.lock();
        if !state.connected.contains(id) {
            return Err(AdapterError::NotConnected);
        }
        let (tx, rx) = mpsc::unbounded();
        state.subscriptions.insert(characteristic, tx);
        Ok(rx.boxed())
    }

    async fn unsubscribe_characteristic(
        &self,
        _id: &PeripheralId,
        characteristic: Uuid,
    ) -> AdapterResult<()> {
        let mut state = self.state.lock();
        state.unsubscribes += 1;
        state.subscriptions.remove(&characteristic);
        Ok(())
    }

    async fn disconnect(&self, id: &PeripheralId) -> AdapterResult<()> {
        let mut state = self.state.lock();
        state.disconnects += 1;
        state.connected.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_delivers_queued_advertisements() {
        let adapter = MockBleAdapter::new();
        adapter.add_advertisement(DiscoveredPeripheral::new("A"));

        let mut stream = adapter.start_scan(ScanFilter::default()).await.unwrap();
        assert_eq!(stream.next().await.map(|p| p.id), Some(PeripheralId::new("A")));
        assert!(adapter.inject_advertisement(DiscoveredPeripheral::new("B")));
        assert_eq!(stream.next().await.map(|p| p.id), Some(PeripheralId::new("B")));

        adapter.stop_scan().await.unwrap();
        assert!(!adapter.is_scanning());
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let adapter = MockBleAdapter::new();
        let id = PeripheralId::new("A");
        adapter.fail_connects(1);

        assert!(adapter.connect(&id).await.is_err());
        assert!(adapter.connect(&id).await.is_ok());
        assert_eq!(adapter.connect_count(), 2);
        assert!(adapter.is_connected(&id));
    }

    #[tokio::test]
    async fn test_notifications_end_on_link_drop() {
        let adapter = MockBleAdapter::new();
        let id = PeripheralId::new("A");
        adapter.connect(&id).await.unwrap();

        let mut stream = adapter
            .subscribe_characteristic(&id, HEART_RATE_SERVICE_UUID)
            .await
            .unwrap();
        assert!(adapter.notify(HEART_RATE_SERVICE_UUID, vec![1]));
        assert_eq!(stream.next().await, Some(vec![1]));

        adapter.drop_link();
        assert_eq!(stream.next().await, None);
        assert_eq!(adapter.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_radio_state_queue() {
        let adapter = MockBleAdapter::new();
        adapter.push_radio_state(RadioState::Unknown);
        assert_eq!(adapter.radio_state().await.unwrap(), RadioState::Unknown);
        assert_eq!(adapter.radio_state().await.unwrap(), RadioState::PoweredOn);
    }
}
