// src/io/error.rs
//
// Typed errors for drivers, the driver factory and the connection manager.

use std::fmt;

use thiserror::Error;

/// Errors raised by transport drivers.
///
/// Every variant carries the device description (e.g. `serial(/dev/ttyUSB0)`,
/// `tcp(10.0.0.2:23)`) so log lines and `error` events are self-describing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IoError {
    #[error("{device}: connection failed: {message}")]
    Connection { device: String, message: String },

    #[error("{device}: timed out during {operation}")]
    Timeout { device: String, operation: String },

    #[error("{device}: protocol error: {message}")]
    Protocol { device: String, message: String },

    #[error("{device}: read failed: {message}")]
    Read { device: String, message: String },

    #[error("{device}: write failed: {message}")]
    Write { device: String, message: String },

    #[error("{device}: invalid configuration: {message}")]
    Configuration { device: String, message: String },

    #[error("{device}: not open")]
    NotOpen { device: String },

    #[error("{device}: not supported on this platform: {message}")]
    Unsupported { device: String, message: String },
}

impl IoError {
    pub fn connection(device: &str, message: impl Into<String>) -> Self {
        IoError::Connection {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn timeout(device: &str, operation: impl Into<String>) -> Self {
        IoError::Timeout {
            device: device.to_string(),
            operation: operation.into(),
        }
    }

    pub fn protocol(device: &str, message: impl Into<String>) -> Self {
        IoError::Protocol {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn read(device: &str, message: impl Into<String>) -> Self {
        IoError::Read {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn write(device: &str, message: impl Into<String>) -> Self {
        IoError::Write {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn configuration(device: &str, message: impl Into<String>) -> Self {
        IoError::Configuration {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn not_open(device: &str) -> Self {
        IoError::NotOpen {
            device: device.to_string(),
        }
    }

    pub fn unsupported(device: &str, message: impl Into<String>) -> Self {
        IoError::Unsupported {
            device: device.to_string(),
            message: message.into(),
        }
    }
}

/// Field-level configuration validation failures.
///
/// Never empty when returned as an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigErrors(pub Vec<String>);

impl ConfigErrors {
    pub fn new() -> Self {
        ConfigErrors(Vec::new())
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.0.push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn messages(&self) -> &[String] {
        &self.0
    }

    /// `Ok(())` when nothing was recorded, otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), ConfigErrors> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.0.join(", "))
    }
}

impl std::error::Error for ConfigErrors {}

/// Result of a driver's `validate_configuration`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl From<Result<(), ConfigErrors>> for ValidationResult {
    fn from(result: Result<(), ConfigErrors>) -> Self {
        match result {
            Ok(()) => ValidationResult {
                valid: true,
                errors: Vec::new(),
            },
            Err(errors) => ValidationResult {
                valid: false,
                errors: errors.0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_messages_name_device() {
        let err = IoError::timeout("tcp(127.0.0.1:23)", "connect");
        assert_eq!(err.to_string(), "tcp(127.0.0.1:23): timed out during connect");
        let err = IoError::connection("serial(COM3)", "access denied");
        assert!(err.to_string().contains("access denied"));
    }

    #[test]
    fn test_config_errors_into_result() {
        assert!(ConfigErrors::new().into_result().is_ok());

        let mut errors = ConfigErrors::new();
        errors.push("Port is required");
        errors.push("Invalid baud rate: 7");
        let err = errors.into_result().unwrap_err();
        assert_eq!(err.messages().len(), 2);
        assert_eq!(
            err.to_string(),
            "invalid configuration: Port is required, Invalid baud rate: 7"
        );

        let result: ValidationResult = Err(err).into();
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 2);
    }
}
