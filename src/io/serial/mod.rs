// src/io/serial/mod.rs
//
// Serial port driver.
//
// Features:
// - Blocking read loop on a dedicated thread, feeding the chunk aggregator
// - Writes and DTR/RTS control routed to the port-owning thread
// - Fixed-interval reconnect loop when the port drops

mod driver;
pub(crate) mod utils;

pub use driver::SerialDriver;
pub use utils::{FlowControl, Parity};

use serde::{Deserialize, Serialize};

use super::error::{ConfigErrors, IoError};

/// Baud rates accepted by validation
pub const VALID_BAUD_RATES: [u32; 17] = [
    110, 300, 600, 1200, 2400, 4800, 9600, 14400, 19200, 38400, 57600, 115200, 128000, 230400,
    256000, 460800, 921600,
];

// ============================================================================
// Configuration
// ============================================================================

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UartConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    /// 1, 1.5 or 2
    pub stop_bits: f32,
    pub parity: Parity,
    pub flow_control: FlowControl,
    pub auto_reconnect: bool,
    /// Write timeout
    pub timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    /// DTR level applied after open
    pub dtr: Option<bool>,
    /// RTS level applied after open
    pub rts: Option<bool>,
}

impl Default for UartConfig {
    fn default() -> Self {
        UartConfig {
            port: String::new(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1.0,
            parity: Parity::None,
            flow_control: FlowControl::None,
            auto_reconnect: true,
            timeout_ms: 1000,
            reconnect_interval_ms: 5000,
            dtr: None,
            rts: None,
        }
    }
}

impl UartConfig {
    pub fn validate(&self) -> Result<(), ConfigErrors> {
        let mut errors = ConfigErrors::new();

        if self.port.trim().is_empty() {
            errors.push("Port is required");
        }
        if !VALID_BAUD_RATES.contains(&self.baud_rate) {
            errors.push(format!("Invalid baud rate: {}", self.baud_rate));
        }
        if !(5..=8).contains(&self.data_bits) {
            errors.push(format!("Invalid data bits: {}", self.data_bits));
        }
        if ![1.0, 1.5, 2.0].contains(&self.stop_bits) {
            errors.push(format!("Invalid stop bits: {}", self.stop_bits));
        }
        if self.reconnect_interval_ms == 0 {
            errors.push("Reconnect interval must be greater than zero");
        }

        errors.into_result()
    }
}

// ============================================================================
// Port discovery
// ============================================================================

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

/// List available serial ports
///
/// On macOS, filters out /dev/tty.* devices and only shows /dev/cu.* devices.
/// The cu (calling unit) devices are non-blocking and preferred for outgoing connections.
pub fn list_ports() -> Result<Vec<SerialPortInfo>, IoError> {
    let ports = serialport::available_ports()
        .map_err(|e| IoError::connection("serial", format!("failed to enumerate ports: {}", e)))?;

    Ok(ports
        .into_iter()
        .filter(|_p| {
            #[cfg(target_os = "macos")]
            {
                !_p.port_name.starts_with("/dev/tty.")
            }
            #[cfg(not(target_os = "macos"))]
            {
                true
            }
        })
        .map(|p| {
            let (port_type, manufacturer, product, serial_number, vid, pid) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => (
                    "USB",
                    info.manufacturer,
                    info.product,
                    info.serial_number,
                    Some(info.vid),
                    Some(info.pid),
                ),
                serialport::SerialPortType::BluetoothPort => {
                    ("Bluetooth", None, None, None, None, None)
                }
                serialport::SerialPortType::PciPort => ("PCI", None, None, None, None, None),
                serialport::SerialPortType::Unknown => ("Unknown", None, None, None, None, None),
            };
            SerialPortInfo {
                port_name: p.port_name,
                port_type: port_type.to_string(),
                manufacturer,
                product,
                serial_number,
                vid,
                pid,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(port: &str) -> UartConfig {
        UartConfig {
            port: port.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let cfg = UartConfig::default();
        assert_eq!(cfg.baud_rate, 9600);
        assert_eq!(cfg.data_bits, 8);
        assert_eq!(cfg.stop_bits, 1.0);
        assert_eq!(cfg.parity, Parity::None);
        assert_eq!(cfg.flow_control, FlowControl::None);
        assert!(cfg.auto_reconnect);
        assert_eq!(cfg.reconnect_interval_ms, 5000);
    }

    #[test]
    fn test_valid_config() {
        assert!(config("/dev/ttyUSB0").validate().is_ok());
        let cfg = UartConfig {
            baud_rate: 115200,
            data_bits: 7,
            stop_bits: 1.5,
            parity: Parity::Even,
            ..config("COM3")
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_collects_every_error() {
        let cfg = UartConfig {
            baud_rate: 12345,
            data_bits: 9,
            stop_bits: 3.0,
            ..config("")
        };
        let errors = cfg.validate().unwrap_err();
        assert_eq!(
            errors.messages(),
            &[
                "Port is required".to_string(),
                "Invalid baud rate: 12345".to_string(),
                "Invalid data bits: 9".to_string(),
                "Invalid stop bits: 3".to_string(),
            ]
        );
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: UartConfig = toml::from_str("port = \"/dev/ttyACM0\"\nparity = \"odd\"").unwrap();
        assert_eq!(cfg.port, "/dev/ttyACM0");
        assert_eq!(cfg.parity, Parity::Odd);
        assert_eq!(cfg.baud_rate, 9600);
    }
}
