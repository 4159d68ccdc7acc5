// src/io/mock.rs
//
// Scripted transports for tests: an in-memory driver controlled through a
// `MockControl` handle, and a BLE backend with a fake peripheral list.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::StreamExt;
use uuid::Uuid;

use super::ble::{BleBackend, BleDeviceInfo, BleError, NotificationStream};
use super::driver::{Driver, DriverContext, DriverCore, DriverEvent};
use super::error::{IoError, ValidationResult};
use super::factory::{DriverFactory, DriverFeatures, DriverInfo};
use super::{BusType, DeviceConfig};

// ============================================================================
// Mock driver
// ============================================================================

#[derive(Default)]
struct MockState {
    fail_open: AtomicBool,
    opens: AtomicUsize,
    closes: AtomicUsize,
    open: AtomicBool,
    writes: Mutex<Vec<Vec<u8>>>,
    core: Mutex<Option<Arc<DriverCore>>>,
}

/// Test-side handle to every [`MockDriver`] built through it
#[derive(Clone, Default)]
pub struct MockControl {
    state: Arc<MockState>,
}

impl MockControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `factory` build mock drivers for `bus_type`
    pub fn install(&self, factory: &DriverFactory, bus_type: BusType) {
        let control = self.clone();
        let default_config = factory
            .default_config(bus_type)
            .unwrap_or_default();
        factory.register(
            DriverInfo {
                bus_type,
                name: "Mock".to_string(),
                description: "In-memory test driver".to_string(),
                supported: true,
                features: DriverFeatures {
                    bidirectional: true,
                    streaming: true,
                    discovery: false,
                    reconnection: true,
                    multiple_connections: false,
                },
                default_config,
            },
            Arc::new(move |_: DeviceConfig, ctx: &DriverContext| {
                Ok(Box::new(MockDriver::new(control.clone(), ctx)) as Box<dyn Driver>)
            }),
        );
    }

    pub fn fail_open(&self, fail: bool) {
        self.state.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.writes.lock().unwrap().clone()
    }

    fn core(&self) -> Arc<DriverCore> {
        self.state
            .core
            .lock()
            .unwrap()
            .clone()
            .expect("no mock driver has been created")
    }

    /// Deliver bytes as one `Data` event, as if read from the wire
    pub async fn feed(&self, data: &[u8]) {
        let core = self.core();
        core.ingest(data).await;
        core.flush().await;
    }

    /// Send a raw driver event (reconnect cycle, error)
    pub async fn send(&self, event: DriverEvent) {
        self.core().emit(event).await;
    }
}

pub struct MockDriver {
    control: MockControl,
    core: Arc<DriverCore>,
}

impl MockDriver {
    pub const NAME: &'static str = "mock(0)";

    pub fn new(control: MockControl, ctx: &DriverContext) -> Self {
        let core = DriverCore::new(Self::NAME, ctx);
        *control.state.core.lock().unwrap() = Some(core.clone());
        MockDriver { control, core }
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn bus_type(&self) -> BusType {
        BusType::Uart
    }

    fn core(&self) -> &DriverCore {
        &self.core
    }

    async fn open(&mut self) -> Result<(), IoError> {
        let state = &self.control.state;
        state.opens.fetch_add(1, Ordering::SeqCst);
        if state.fail_open.load(Ordering::SeqCst) {
            return Err(IoError::connection(Self::NAME, "scripted open failure"));
        }
        state.open.store(true, Ordering::SeqCst);
        self.core.mark_opened();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), IoError> {
        let state = &self.control.state;
        state.closes.fetch_add(1, Ordering::SeqCst);
        state.open.store(false, Ordering::SeqCst);
        self.core.mark_closed();
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<usize, IoError> {
        if !self.is_open() {
            return Err(IoError::not_open(Self::NAME));
        }
        self.control.state.writes.lock().unwrap().push(data.to_vec());
        self.core.record_sent(data.len());
        Ok(data.len())
    }

    fn is_open(&self) -> bool {
        self.control.state.open.load(Ordering::SeqCst)
    }

    fn validate_configuration(&self) -> ValidationResult {
        Ok(()).into()
    }
}

// ============================================================================
// Scripted BLE backend
// ============================================================================

/// BLE backend with a fixed peripheral list and one fake link.
pub struct ScriptedBleBackend {
    devices: Vec<String>,
    linked: AtomicBool,
    has_characteristic: AtomicBool,
    connects: AtomicUsize,
    writes: Mutex<Vec<Vec<u8>>>,
    notifier: Mutex<Option<fmpsc::UnboundedSender<Vec<u8>>>>,
}

impl ScriptedBleBackend {
    pub fn new(devices: &[&str]) -> Self {
        ScriptedBleBackend {
            devices: devices.iter().map(|d| d.to_string()).collect(),
            linked: AtomicBool::new(false),
            has_characteristic: AtomicBool::new(true),
            connects: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
            notifier: Mutex::new(None),
        }
    }

    pub fn set_has_characteristic(&self, present: bool) {
        self.has_characteristic.store(present, Ordering::SeqCst);
    }

    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    /// Push a notification to the current subscriber
    pub fn notify(&self, data: &[u8]) {
        if let Some(tx) = self.notifier.lock().unwrap().as_ref() {
            let _ = tx.unbounded_send(data.to_vec());
        }
    }

    /// Simulate the peripheral going out of range
    pub fn drop_link(&self) {
        self.linked.store(false, Ordering::SeqCst);
        self.notifier.lock().unwrap().take();
    }

    fn info(id: &str) -> BleDeviceInfo {
        BleDeviceInfo {
            id: id.to_string(),
            name: format!("Scripted {}", id),
            rssi: Some(-60),
        }
    }
}

#[async_trait]
impl BleBackend for ScriptedBleBackend {
    async fn is_supported(&self) -> bool {
        true
    }

    async fn scan(&self, _timeout: Duration) -> Result<Vec<BleDeviceInfo>, BleError> {
        Ok(self.devices.iter().map(|d| Self::info(d)).collect())
    }

    async fn find(&self, device_id: &str, _timeout: Duration) -> Result<BleDeviceInfo, BleError> {
        self.devices
            .iter()
            .find(|d| d.as_str() == device_id)
            .map(|d| Self::info(d))
            .ok_or_else(|| BleError::DeviceNotFound(device_id.to_string()))
    }

    async fn connect(&self, _device_id: &str) -> Result<(), BleError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.linked.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn discover(&self, _: &str, _: Uuid, characteristic: Uuid) -> Result<(), BleError> {
        if self.has_characteristic.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BleError::CharacteristicNotFound(characteristic))
        }
    }

    async fn subscribe(&self, _: &str, _: Uuid) -> Result<NotificationStream, BleError> {
        let (tx, rx) = fmpsc::unbounded();
        *self.notifier.lock().unwrap() = Some(tx);
        Ok(rx.boxed())
    }

    async fn write(&self, _: &str, _: Uuid, data: &[u8]) -> Result<(), BleError> {
        if !self.is_linked() {
            return Err(BleError::Backend("not connected".to_string()));
        }
        self.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn disconnect(&self, _device_id: &str) -> Result<(), BleError> {
        self.drop_link();
        Ok(())
    }

    async fn is_connected(&self, _device_id: &str) -> bool {
        self.is_linked()
    }
}
