// src/io/mod.rs
//
// Transport layer: driver contract, transport drivers, driver factory and
// the connection manager, plus the shared data model they exchange.

pub mod ble;
mod driver;
pub mod error;
mod factory;
mod manager;
pub mod network;
pub mod serial;

#[cfg(test)]
pub(crate) mod mock;

pub use ble::BleConfig;
pub use driver::{
    ChunkAggregator, Driver, DriverContext, DriverCore, DriverEvent, DriverStats,
    DEFAULT_DRIVER_BUFFER_SIZE,
};
pub use error::{ConfigErrors, IoError, ValidationResult};
pub use factory::{DiscoveredDevice, DriverConstructor, DriverFactory, DriverFeatures, DriverInfo};
pub use manager::{ConnectionManager, ManagerError};
pub use network::NetworkConfig;
pub use serial::UartConfig;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::framing::RawFrame;
use crate::pool::{Pooled, Poolable};

// ============================================================================
// Time
// ============================================================================

/// Get current time in milliseconds since UNIX epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Device configuration
// ============================================================================

/// Transport kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusType {
    Uart,
    Network,
    BluetoothLe,
}

impl BusType {
    pub const ALL: [BusType; 3] = [BusType::Uart, BusType::Network, BusType::BluetoothLe];

    pub fn as_str(&self) -> &'static str {
        match self {
            BusType::Uart => "uart",
            BusType::Network => "network",
            BusType::BluetoothLe => "bluetooth_le",
        }
    }
}

impl std::fmt::Display for BusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport configuration, tagged by transport kind.
///
/// A driver is built from one of these and keeps it for its lifetime;
/// changing transport settings means building a new driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceConfig {
    Uart(UartConfig),
    Network(NetworkConfig),
    BluetoothLe(BleConfig),
}

impl DeviceConfig {
    pub fn bus_type(&self) -> BusType {
        match self {
            DeviceConfig::Uart(_) => BusType::Uart,
            DeviceConfig::Network(_) => BusType::Network,
            DeviceConfig::BluetoothLe(_) => BusType::BluetoothLe,
        }
    }

    /// Run the validator for this transport kind
    pub fn validate(&self) -> Result<(), ConfigErrors> {
        match self {
            DeviceConfig::Uart(c) => c.validate(),
            DeviceConfig::Network(c) => c.validate(),
            DeviceConfig::BluetoothLe(c) => c.validate(),
        }
    }

    /// Short human-readable description, e.g. `serial(/dev/ttyUSB0)`
    pub fn describe(&self) -> String {
        match self {
            DeviceConfig::Uart(c) => format!("serial({})", c.port),
            DeviceConfig::Network(c) => c.describe(),
            DeviceConfig::BluetoothLe(c) => format!("ble({})", c.device_id),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig::Uart(UartConfig::default())
    }
}

// ============================================================================
// Connection state, statistics and events
// ============================================================================

/// Connection state owned by the connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Per-connection traffic counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunicationStatistics {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub errors: u64,
    pub reconnections: u64,
    /// Milliseconds since the current connection was established
    pub uptime_ms: u64,
}

impl Poolable for CommunicationStatistics {
    fn reset(&mut self) {
        *self = CommunicationStatistics::default();
    }
}

/// A decoded frame on loan from the frame pool. It goes back to the pool
/// once every subscriber has dropped its clone.
pub type SharedFrame = Arc<Pooled<RawFrame>>;

/// Events published by the connection manager
#[derive(Debug, Clone)]
pub enum IoEvent {
    StateChanged(ConnectionState),
    FrameReceived(SharedFrame),
    RawDataReceived { data: Arc<Vec<u8>>, timestamp: u64 },
    Error(String),
    Warning(String),
    StatisticsUpdated(CommunicationStatistics),
}
