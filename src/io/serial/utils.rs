// src/io/serial/utils.rs
//
// Line-setting types for the serial driver and their conversions to the
// serialport crate's types.

use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl as SpFlowControl, Parity as SpParity, StopBits};

// ============================================================================
// Types
// ============================================================================

/// Parity setting for serial port configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

/// Flow control setting for serial port configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    /// Software flow control
    Xon,
    /// Hardware (RTS/CTS) flow control
    Rts,
    /// Both; serialport can only express one, hardware wins
    XonRts,
}

// ============================================================================
// Conversion Functions
// ============================================================================

/// Convert our Parity enum to serialport crate's Parity type.
///
/// Mark and space parity have no serialport equivalent.
pub fn to_serialport_parity(p: Parity) -> Option<SpParity> {
    match p {
        Parity::None => Some(SpParity::None),
        Parity::Odd => Some(SpParity::Odd),
        Parity::Even => Some(SpParity::Even),
        Parity::Mark | Parity::Space => None,
    }
}

pub fn to_serialport_flow_control(f: FlowControl) -> SpFlowControl {
    match f {
        FlowControl::None => SpFlowControl::None,
        FlowControl::Xon => SpFlowControl::Software,
        FlowControl::Rts | FlowControl::XonRts => SpFlowControl::Hardware,
    }
}

/// Convert data bits count to serialport crate's DataBits type
pub fn to_serialport_data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

/// Convert stop bits to serialport crate's StopBits type (1.5 maps to two)
pub fn to_serialport_stop_bits(bits: f32) -> StopBits {
    if bits > 1.0 {
        StopBits::Two
    } else {
        StopBits::One
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parity_default() {
        assert_eq!(Parity::default(), Parity::None);
    }

    #[test]
    fn test_to_serialport_parity() {
        assert!(matches!(to_serialport_parity(Parity::None), Some(SpParity::None)));
        assert!(matches!(to_serialport_parity(Parity::Odd), Some(SpParity::Odd)));
        assert!(matches!(to_serialport_parity(Parity::Even), Some(SpParity::Even)));
        assert!(to_serialport_parity(Parity::Mark).is_none());
        assert!(to_serialport_parity(Parity::Space).is_none());
    }

    #[test]
    fn test_to_serialport_flow_control() {
        assert!(matches!(to_serialport_flow_control(FlowControl::None), SpFlowControl::None));
        assert!(matches!(to_serialport_flow_control(FlowControl::Xon), SpFlowControl::Software));
        assert!(matches!(to_serialport_flow_control(FlowControl::Rts), SpFlowControl::Hardware));
        assert!(matches!(to_serialport_flow_control(FlowControl::XonRts), SpFlowControl::Hardware));
    }

    #[test]
    fn test_to_serialport_data_bits() {
        assert!(matches!(to_serialport_data_bits(5), DataBits::Five));
        assert!(matches!(to_serialport_data_bits(7), DataBits::Seven));
        assert!(matches!(to_serialport_data_bits(8), DataBits::Eight));
    }

    #[test]
    fn test_to_serialport_stop_bits() {
        assert!(matches!(to_serialport_stop_bits(1.0), StopBits::One));
        assert!(matches!(to_serialport_stop_bits(1.5), StopBits::Two));
        assert!(matches!(to_serialport_stop_bits(2.0), StopBits::Two));
    }

    #[test]
    fn test_flow_control_names() {
        let f: FlowControl = serde_json::from_str("\"xonrts\"").unwrap();
        assert_eq!(f, FlowControl::XonRts);
    }
}
