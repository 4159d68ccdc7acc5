// src/io/ble/btle.rs
//
// btleplug-backed Bluetooth LE access. The manager and first adapter are
// initialised on first use and kept for the life of the backend.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};
use uuid::Uuid;

use super::{BleBackend, BleDeviceInfo, BleError, NotificationStream};

/// Poll interval while waiting for a peripheral to show up in a scan
const SCAN_POLL: Duration = Duration::from_millis(500);

struct AdapterState {
    _manager: Manager,
    adapter: Adapter,
}

pub struct BtleplugBackend {
    state: OnceCell<AdapterState>,
    /// Peripherals resolved by `find`, keyed by id string
    peripherals: Mutex<HashMap<String, Peripheral>>,
}

impl BtleplugBackend {
    pub fn new() -> Self {
        BtleplugBackend {
            state: OnceCell::new(),
            peripherals: Mutex::new(HashMap::new()),
        }
    }

    /// Initialise the BLE manager and adapter if not already done.
    async fn adapter(&self) -> Result<&Adapter, BleError> {
        let state = self
            .state
            .get_or_try_init(|| async {
                let manager = Manager::new()
                    .await
                    .map_err(|e| BleError::Backend(format!("BLE manager init failed: {e}")))?;
                let adapters = manager
                    .adapters()
                    .await
                    .map_err(|e| BleError::Backend(format!("Failed to list BLE adapters: {e}")))?;
                let adapter = adapters
                    .into_iter()
                    .next()
                    .ok_or(BleError::AdapterUnavailable)?;
                Ok::<_, BleError>(AdapterState {
                    _manager: manager,
                    adapter,
                })
            })
            .await?;
        Ok(&state.adapter)
    }

    async fn peripheral(&self, device_id: &str) -> Result<Peripheral, BleError> {
        if let Some(p) = self.peripherals.lock().await.get(device_id) {
            return Ok(p.clone());
        }
        let adapter = self.adapter().await?;
        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|e| BleError::Backend(format!("Failed to list peripherals: {e}")))?;
        let peripheral = peripherals
            .into_iter()
            .find(|p| p.id().to_string() == device_id)
            .ok_or_else(|| BleError::DeviceNotFound(device_id.to_string()))?;
        self.peripherals
            .lock()
            .await
            .insert(device_id.to_string(), peripheral.clone());
        Ok(peripheral)
    }

    async fn characteristic(
        &self,
        device_id: &str,
        uuid: Uuid,
    ) -> Result<(Peripheral, Characteristic), BleError> {
        let peripheral = self.peripheral(device_id).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(BleError::CharacteristicNotFound(uuid))?;
        Ok((peripheral, characteristic))
    }
}

impl Default for BtleplugBackend {
    fn default() -> Self {
        Self::new()
    }
}

async fn describe(peripheral: &Peripheral) -> BleDeviceInfo {
    let id = peripheral.id().to_string();
    let props = peripheral.properties().await.ok().flatten();
    let name = props
        .as_ref()
        .and_then(|p| p.local_name.clone())
        .unwrap_or_else(|| id.clone());
    BleDeviceInfo {
        id,
        name,
        rssi: props.and_then(|p| p.rssi),
    }
}

#[async_trait]
impl BleBackend for BtleplugBackend {
    async fn is_supported(&self) -> bool {
        self.adapter().await.is_ok()
    }

    async fn scan(&self, timeout: Duration) -> Result<Vec<BleDeviceInfo>, BleError> {
        let adapter = self.adapter().await?;
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| BleError::Backend(format!("Failed to start BLE scan: {e}")))?;
        tokio::time::sleep(timeout).await;

        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|e| BleError::Backend(format!("Failed to list peripherals: {e}")));
        let _ = adapter.stop_scan().await;

        let mut devices = Vec::new();
        for peripheral in peripherals? {
            devices.push(describe(&peripheral).await);
        }
        info!("[ble] Scan finished, {} device(s)", devices.len());
        Ok(devices)
    }

    async fn find(&self, device_id: &str, timeout: Duration) -> Result<BleDeviceInfo, BleError> {
        let adapter = self.adapter().await?;
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| BleError::Backend(format!("Failed to start BLE scan: {e}")))?;

        let deadline = tokio::time::Instant::now() + timeout;
        let found = loop {
            if let Ok(peripherals) = adapter.peripherals().await {
                if let Some(p) = peripherals
                    .into_iter()
                    .find(|p| p.id().to_string() == device_id)
                {
                    break Some(p);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break None;
            }
            tokio::time::sleep(SCAN_POLL).await;
        };
        let _ = adapter.stop_scan().await;

        let peripheral = found.ok_or_else(|| BleError::DeviceNotFound(device_id.to_string()))?;
        let info = describe(&peripheral).await;
        self.peripherals
            .lock()
            .await
            .insert(device_id.to_string(), peripheral);
        Ok(info)
    }

    async fn connect(&self, device_id: &str) -> Result<(), BleError> {
        let peripheral = self.peripheral(device_id).await?;
        debug!("[ble] Connecting to {device_id}...");
        peripheral
            .connect()
            .await
            .map_err(|e| BleError::Backend(format!("Failed to connect: {e}")))
    }

    async fn discover(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), BleError> {
        let peripheral = self.peripheral(device_id).await?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| BleError::Backend(format!("Failed to discover services: {e}")))?;

        let service = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .ok_or(BleError::ServiceNotFound(service))?;
        if !service.characteristics.iter().any(|c| c.uuid == characteristic) {
            return Err(BleError::CharacteristicNotFound(characteristic));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        device_id: &str,
        characteristic: Uuid,
    ) -> Result<NotificationStream, BleError> {
        let (peripheral, char) = self.characteristic(device_id, characteristic).await?;
        if !char
            .properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
        {
            return Err(BleError::Backend(format!(
                "characteristic {} does not support notifications",
                characteristic
            )));
        }
        let stream = peripheral
            .notifications()
            .await
            .map_err(|e| BleError::Backend(format!("Failed to open notifications: {e}")))?;
        peripheral
            .subscribe(&char)
            .await
            .map_err(|e| BleError::Backend(format!("Failed to subscribe: {e}")))?;

        // The stream is multiplexed across every subscribed characteristic
        Ok(stream
            .filter_map(move |n| async move { (n.uuid == characteristic).then_some(n.value) })
            .boxed())
    }

    async fn write(
        &self,
        device_id: &str,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), BleError> {
        let (peripheral, char) = self.characteristic(device_id, characteristic).await?;
        let write_type = if char.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        peripheral
            .write(&char, data, write_type)
            .await
            .map_err(|e| BleError::Backend(format!("Failed to write: {e}")))
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), BleError> {
        let peripheral = self.peripherals.lock().await.get(device_id).cloned();
        if let Some(peripheral) = peripheral {
            debug!("[ble] Disconnecting from {device_id}");
            // Best-effort; the peripheral may already be gone
            let _ = peripheral.disconnect().await;
        }
        Ok(())
    }

    async fn is_connected(&self, device_id: &str) -> bool {
        let peripheral = self.peripherals.lock().await.get(device_id).cloned();
        match peripheral {
            Some(p) => p.is_connected().await.unwrap_or(false),
            None => false,
        }
    }
}
