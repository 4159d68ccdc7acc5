// src/io/ble/mod.rs
//
// Bluetooth LE driver.
//
// The driver walks discovery (scan with timeout) -> connect (with timeout)
// -> service/characteristic discovery -> notification subscribe, then
// forwards notifications through the chunk aggregator. The radio itself
// sits behind `BleBackend`; the btleplug backend is compiled in with the
// `ble` feature.

#[cfg(feature = "ble")]
mod btle;
mod driver;

#[cfg(feature = "ble")]
pub use btle::BtleplugBackend;
pub use driver::BleDriver;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::error::ConfigErrors;

// ============================================================================
// Configuration
// ============================================================================

/// Bluetooth LE connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Platform peripheral id (address on Linux/Windows, UUID on macOS)
    pub device_id: String,
    /// Short (`180D`) or full UUID
    pub service_uuid: String,
    pub characteristic_uuid: String,
    pub scan_timeout_ms: u64,
    pub connection_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    pub auto_discover_services: bool,
    pub enable_notifications: bool,
    pub auto_reconnect: bool,
}

impl Default for BleConfig {
    fn default() -> Self {
        BleConfig {
            device_id: String::new(),
            service_uuid: String::new(),
            characteristic_uuid: String::new(),
            scan_timeout_ms: 10000,
            connection_timeout_ms: 15000,
            reconnect_interval_ms: 5000,
            auto_discover_services: true,
            enable_notifications: true,
            auto_reconnect: true,
        }
    }
}

impl BleConfig {
    pub fn validate(&self) -> Result<(), ConfigErrors> {
        let mut errors = ConfigErrors::new();

        if self.device_id.trim().is_empty() {
            errors.push("Device ID is required");
        }
        if self.service_uuid.trim().is_empty() {
            errors.push("Service UUID is required");
        } else if parse_ble_uuid(&self.service_uuid).is_none() {
            errors.push(format!("Invalid service UUID format: {}", self.service_uuid));
        }
        if self.characteristic_uuid.trim().is_empty() {
            errors.push("Characteristic UUID is required");
        } else if parse_ble_uuid(&self.characteristic_uuid).is_none() {
            errors.push(format!(
                "Invalid characteristic UUID format: {}",
                self.characteristic_uuid
            ));
        }
        if self.scan_timeout_ms < 1000 {
            errors.push("Scan timeout must be at least 1000ms");
        }
        if self.connection_timeout_ms < 5000 {
            errors.push("Connection timeout must be at least 5000ms");
        }

        errors.into_result()
    }

    /// Parsed (service, characteristic) UUIDs
    pub fn uuids(&self) -> Option<(Uuid, Uuid)> {
        Some((
            parse_ble_uuid(&self.service_uuid)?,
            parse_ble_uuid(&self.characteristic_uuid)?,
        ))
    }
}

/// Build a 128-bit UUID from the same 5-field encoding used by Zephyr's
/// BT_UUID_128_ENCODE macro.
pub const fn uuid_from_fields(a: u32, b: u16, c: u16, d: u16, e: u64) -> Uuid {
    let hi: u64 = (a as u64) << 32 | (b as u64) << 16 | c as u64;
    let lo: u64 = (d as u64) << 48 | e;
    Uuid::from_u128(((hi as u128) << 64) | lo as u128)
}

/// Parse a 16-bit short UUID (`180D`) against the Bluetooth base UUID, or a
/// full 8-4-4-4-12 UUID.
pub fn parse_ble_uuid(s: &str) -> Option<Uuid> {
    let s = s.trim();
    if s.len() == 4 && s.chars().all(|c| c.is_ascii_hexdigit()) {
        let short = u16::from_str_radix(s, 16).ok()?;
        return Some(uuid_from_fields(short as u32, 0x0000, 0x1000, 0x8000, 0x00805f9b34fb));
    }
    if s.len() == 36 {
        return Uuid::parse_str(s).ok();
    }
    None
}

// ============================================================================
// Backend
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BleError {
    #[error("no Bluetooth adapter available")]
    AdapterUnavailable,
    #[error("device '{0}' not found")]
    DeviceNotFound(String),
    #[error("service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
    #[error("{0}")]
    Backend(String),
}

/// A peripheral seen during a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BleDeviceInfo {
    pub id: String,
    pub name: String,
    pub rssi: Option<i16>,
}

/// Notifications from a subscribed characteristic. Ends when the
/// subscription is torn down.
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// Platform Bluetooth LE access used by [`BleDriver`].
#[async_trait]
pub trait BleBackend: Send + Sync {
    /// Whether a usable adapter exists
    async fn is_supported(&self) -> bool;

    /// Every peripheral seen within `timeout`
    async fn scan(&self, timeout: Duration) -> Result<Vec<BleDeviceInfo>, BleError>;

    /// Scan until `device_id` shows up or `timeout` passes
    async fn find(&self, device_id: &str, timeout: Duration) -> Result<BleDeviceInfo, BleError>;

    async fn connect(&self, device_id: &str) -> Result<(), BleError>;

    /// Discover services and check the service/characteristic pair exists
    async fn discover(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), BleError>;

    async fn subscribe(
        &self,
        device_id: &str,
        characteristic: Uuid,
    ) -> Result<NotificationStream, BleError>;

    async fn write(&self, device_id: &str, characteristic: Uuid, data: &[u8])
        -> Result<(), BleError>;

    async fn disconnect(&self, device_id: &str) -> Result<(), BleError>;

    async fn is_connected(&self, device_id: &str) -> bool;
}

/// Backend for builds or hosts without Bluetooth.
pub struct UnsupportedBackend;

#[async_trait]
impl BleBackend for UnsupportedBackend {
    async fn is_supported(&self) -> bool {
        false
    }

    async fn scan(&self, _timeout: Duration) -> Result<Vec<BleDeviceInfo>, BleError> {
        Err(BleError::AdapterUnavailable)
    }

    async fn find(&self, _device_id: &str, _timeout: Duration) -> Result<BleDeviceInfo, BleError> {
        Err(BleError::AdapterUnavailable)
    }

    async fn connect(&self, _device_id: &str) -> Result<(), BleError> {
        Err(BleError::AdapterUnavailable)
    }

    async fn discover(&self, _: &str, _: Uuid, _: Uuid) -> Result<(), BleError> {
        Err(BleError::AdapterUnavailable)
    }

    async fn subscribe(&self, _: &str, _: Uuid) -> Result<NotificationStream, BleError> {
        Err(BleError::AdapterUnavailable)
    }

    async fn write(&self, _: &str, _: Uuid, _: &[u8]) -> Result<(), BleError> {
        Err(BleError::AdapterUnavailable)
    }

    async fn disconnect(&self, _device_id: &str) -> Result<(), BleError> {
        Ok(())
    }

    async fn is_connected(&self, _device_id: &str) -> bool {
        false
    }
}

/// The platform backend for this build
pub fn default_backend() -> Arc<dyn BleBackend> {
    #[cfg(feature = "ble")]
    {
        Arc::new(BtleplugBackend::new())
    }
    #[cfg(not(feature = "ble"))]
    {
        Arc::new(UnsupportedBackend)
    }
}
