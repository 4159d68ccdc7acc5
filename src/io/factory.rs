// src/io/factory.rs
//
// Driver registry: resolves a DeviceConfig to a concrete driver after
// validating it, and exposes per-transport capabilities, defaults and
// device discovery.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use super::ble::{default_backend, BleBackend, BleConfig, BleDriver};
use super::driver::{Driver, DriverContext};
use super::error::{ConfigErrors, IoError};
use super::network::{NetworkConfig, NetworkDriver};
use super::serial::{self, SerialDriver, UartConfig};
use super::{BusType, DeviceConfig};

/// What a transport can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DriverFeatures {
    pub bidirectional: bool,
    pub streaming: bool,
    pub discovery: bool,
    pub reconnection: bool,
    pub multiple_connections: bool,
}

/// Registry entry, as reported to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriverInfo {
    pub bus_type: BusType,
    pub name: String,
    pub description: String,
    pub supported: bool,
    pub features: DriverFeatures,
    pub default_config: DeviceConfig,
}

/// A device found by [`DriverFactory::discover_devices`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    pub bus_type: BusType,
    /// What goes into the config (port name, peripheral id)
    pub id: String,
    pub name: String,
    pub details: Option<String>,
}

/// Builds a driver from a config of its transport kind
pub type DriverConstructor =
    Arc<dyn Fn(DeviceConfig, &DriverContext) -> Result<Box<dyn Driver>, ConfigErrors> + Send + Sync>;

struct Registration {
    info: DriverInfo,
    constructor: DriverConstructor,
}

pub struct DriverFactory {
    registry: RwLock<BTreeMap<BusType, Registration>>,
    ble: Arc<dyn BleBackend>,
}

fn wrong_kind(expected: BusType, got: &DeviceConfig) -> ConfigErrors {
    ConfigErrors(vec![format!(
        "Expected a {} configuration, got {}",
        expected,
        got.bus_type()
    )])
}

impl DriverFactory {
    /// Factory with the platform BLE backend
    pub fn new() -> Self {
        Self::build(default_backend(), cfg!(feature = "ble"))
    }

    /// Factory with a specific BLE backend
    pub fn with_ble_backend(backend: Arc<dyn BleBackend>) -> Self {
        Self::build(backend, true)
    }

    fn build(ble: Arc<dyn BleBackend>, ble_supported: bool) -> Self {
        let factory = DriverFactory {
            registry: RwLock::new(BTreeMap::new()),
            ble: ble.clone(),
        };

        factory.register(
            DriverInfo {
                bus_type: BusType::Uart,
                name: "Serial Port (UART)".to_string(),
                description: "RS-232/RS-485 serial communication".to_string(),
                supported: true,
                features: DriverFeatures {
                    bidirectional: true,
                    streaming: true,
                    discovery: true,
                    reconnection: true,
                    multiple_connections: false,
                },
                default_config: DeviceConfig::Uart(UartConfig::default()),
            },
            Arc::new(|config: DeviceConfig, ctx: &DriverContext| match config {
                DeviceConfig::Uart(c) => Ok(Box::new(SerialDriver::new(c, ctx)) as Box<dyn Driver>),
                other => Err(wrong_kind(BusType::Uart, &other)),
            }),
        );

        factory.register(
            DriverInfo {
                bus_type: BusType::Network,
                name: "Network (TCP/UDP)".to_string(),
                description: "TCP/UDP network communication".to_string(),
                supported: true,
                features: DriverFeatures {
                    bidirectional: true,
                    streaming: true,
                    discovery: false,
                    reconnection: true,
                    multiple_connections: true,
                },
                default_config: DeviceConfig::Network(NetworkConfig::default()),
            },
            Arc::new(|config: DeviceConfig, ctx: &DriverContext| match config {
                DeviceConfig::Network(c) => {
                    Ok(Box::new(NetworkDriver::new(c, ctx)) as Box<dyn Driver>)
                }
                other => Err(wrong_kind(BusType::Network, &other)),
            }),
        );

        factory.register(
            DriverInfo {
                bus_type: BusType::BluetoothLe,
                name: "Bluetooth Low Energy".to_string(),
                description: "Bluetooth Low Energy (BLE) communication".to_string(),
                supported: ble_supported,
                features: DriverFeatures {
                    bidirectional: true,
                    streaming: true,
                    discovery: true,
                    reconnection: true,
                    multiple_connections: false,
                },
                default_config: DeviceConfig::BluetoothLe(BleConfig::default()),
            },
            Arc::new(move |config: DeviceConfig, ctx: &DriverContext| match config {
                DeviceConfig::BluetoothLe(c) => {
                    Ok(Box::new(BleDriver::new(c, ble.clone(), ctx)) as Box<dyn Driver>)
                }
                other => Err(wrong_kind(BusType::BluetoothLe, &other)),
            }),
        );

        factory
    }

    fn registry(&self) -> RwLockReadGuard<'_, BTreeMap<BusType, Registration>> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Register (or replace) the driver for a transport kind.
    pub fn register(&self, info: DriverInfo, constructor: DriverConstructor) {
        debug!("[factory] Registered driver '{}' for {}", info.name, info.bus_type);
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(info.bus_type, Registration { info, constructor });
    }

    /// Run the validator for the config's transport kind.
    pub fn validate(&self, config: &DeviceConfig) -> Result<(), ConfigErrors> {
        config.validate()
    }

    /// Validate the config and build a driver for it.
    pub fn create_driver(
        &self,
        config: DeviceConfig,
        ctx: &DriverContext,
    ) -> Result<Box<dyn Driver>, ConfigErrors> {
        let bus_type = config.bus_type();
        let constructor = {
            let registry = self.registry();
            let entry = registry.get(&bus_type).ok_or_else(|| {
                ConfigErrors(vec![format!("Unsupported bus type: {}", bus_type)])
            })?;
            if !entry.info.supported {
                return Err(ConfigErrors(vec![format!(
                    "Driver {} is not supported on this platform",
                    entry.info.name
                )]));
            }
            entry.constructor.clone()
        };

        self.validate(&config)?;
        info!("[factory] Creating driver for {}", config.describe());
        constructor(config, ctx)
    }

    /// Build a driver from the transport's default config with `overrides`
    /// (a JSON object of config fields) applied on top.
    pub fn create_driver_with_defaults(
        &self,
        bus_type: BusType,
        overrides: serde_json::Value,
        ctx: &DriverContext,
    ) -> Result<Box<dyn Driver>, ConfigErrors> {
        let defaults = self.default_config(bus_type).ok_or_else(|| {
            ConfigErrors(vec![format!("Unsupported bus type: {}", bus_type)])
        })?;
        let config = merge_config(&defaults, overrides)?;
        self.create_driver(config, ctx)
    }

    pub fn driver_info(&self, bus_type: BusType) -> Option<DriverInfo> {
        self.registry().get(&bus_type).map(|r| r.info.clone())
    }

    /// Drivers usable on this platform
    pub fn available_drivers(&self) -> Vec<DriverInfo> {
        self.registry()
            .values()
            .filter(|r| r.info.supported)
            .map(|r| r.info.clone())
            .collect()
    }

    /// Every registered driver, supported or not
    pub fn all_drivers(&self) -> Vec<DriverInfo> {
        self.registry().values().map(|r| r.info.clone()).collect()
    }

    pub fn default_config(&self, bus_type: BusType) -> Option<DeviceConfig> {
        self.registry()
            .get(&bus_type)
            .map(|r| r.info.default_config.clone())
    }

    pub fn is_supported(&self, bus_type: BusType) -> bool {
        self.registry()
            .get(&bus_type)
            .map(|r| r.info.supported)
            .unwrap_or(false)
    }

    /// Enumerate devices for a transport. Network has no discovery.
    pub async fn discover_devices(&self, bus_type: BusType) -> Result<Vec<DiscoveredDevice>, IoError> {
        match bus_type {
            BusType::Uart => {
                let ports = tokio::task::spawn_blocking(serial::list_ports)
                    .await
                    .map_err(|e| IoError::connection("serial", e.to_string()))??;
                Ok(ports
                    .into_iter()
                    .map(|p| {
                        let details = match (p.vid, p.pid) {
                            (Some(vid), Some(pid)) => {
                                Some(format!("{} {:04x}:{:04x}", p.port_type, vid, pid))
                            }
                            _ => Some(p.port_type.clone()),
                        };
                        DiscoveredDevice {
                            bus_type,
                            name: p.product.clone().unwrap_or_else(|| p.port_name.clone()),
                            id: p.port_name,
                            details,
                        }
                    })
                    .collect())
            }
            BusType::Network => Ok(Vec::new()),
            BusType::BluetoothLe => {
                if !self.is_supported(BusType::BluetoothLe) {
                    return Err(IoError::unsupported("ble", "Bluetooth LE is not available"));
                }
                let timeout = Duration::from_millis(BleConfig::default().scan_timeout_ms);
                let devices = self
                    .ble
                    .scan(timeout)
                    .await
                    .map_err(|e| IoError::connection("ble", e.to_string()))?;
                Ok(devices
                    .into_iter()
                    .map(|d| DiscoveredDevice {
                        bus_type,
                        details: d.rssi.map(|rssi| format!("RSSI {} dBm", rssi)),
                        id: d.id,
                        name: d.name,
                    })
                    .collect())
            }
        }
    }
}

impl Default for DriverFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply JSON field overrides to a config, keeping its transport tag.
fn merge_config(
    base: &DeviceConfig,
    overrides: serde_json::Value,
) -> Result<DeviceConfig, ConfigErrors> {
    let mut merged =
        serde_json::to_value(base).map_err(|e| ConfigErrors(vec![e.to_string()]))?;
    match (merged.as_object_mut(), overrides) {
        (Some(target), serde_json::Value::Object(fields)) => {
            for (key, value) in fields {
                if key != "type" {
                    target.insert(key, value);
                }
            }
        }
        (_, serde_json::Value::Null) => {}
        _ => return Err(ConfigErrors(vec!["Overrides must be an object".to_string()])),
    }
    serde_json::from_value(merged).map_err(|e| ConfigErrors(vec![e.to_string()]))
}
