// src/io/serial/driver.rs
//
// Serial driver. The port is owned by a blocking thread that reads with a
// short timeout and services write/line-control commands between reads.
// An async supervisor restarts that thread after a fault when
// auto-reconnect is enabled.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serialport::SerialPort;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::utils::{
    to_serialport_data_bits, to_serialport_flow_control, to_serialport_parity,
    to_serialport_stop_bits,
};
use super::UartConfig;
use crate::io::driver::{Driver, DriverContext, DriverCore, DriverEvent};
use crate::io::error::{IoError, ValidationResult};
use crate::io::BusType;

/// Read timeout; also the idle interval after which the aggregator flushes
const READ_TIMEOUT_MS: u64 = 50;
const READ_CHUNK: usize = 4096;

enum SerialCommand {
    Write {
        data: Vec<u8>,
        result_tx: oneshot::Sender<Result<usize, IoError>>,
    },
    SetDtr {
        level: bool,
        result_tx: oneshot::Sender<Result<(), IoError>>,
    },
    SetRts {
        level: bool,
        result_tx: oneshot::Sender<Result<(), IoError>>,
    },
}

/// How a port session ended
enum SessionEnd {
    Stopped,
    Failed(IoError),
}

/// State shared between the driver handle and its supervisor task
struct SerialShared {
    config: UartConfig,
    core: Arc<DriverCore>,
    /// Port currently open (false while reconnecting)
    connected: AtomicBool,
}

pub struct SerialDriver {
    shared: Arc<SerialShared>,
    commands: Mutex<Option<std_mpsc::SyncSender<SerialCommand>>>,
    cancel: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
}

impl SerialDriver {
    pub fn new(config: UartConfig, ctx: &DriverContext) -> Self {
        let core = DriverCore::new(format!("serial({})", config.port), ctx);
        SerialDriver {
            shared: Arc::new(SerialShared {
                config,
                core,
                connected: AtomicBool::new(false),
            }),
            commands: Mutex::new(None),
            cancel: CancellationToken::new(),
            supervisor: None,
        }
    }

    pub fn config(&self) -> &UartConfig {
        &self.shared.config
    }

    fn name(&self) -> &str {
        self.shared.core.name()
    }

    fn sender(&self) -> Result<std_mpsc::SyncSender<SerialCommand>, IoError> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(IoError::not_open(self.name()));
        }
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| IoError::not_open(self.name()))
    }

    async fn send_command<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, IoError>>) -> SerialCommand,
        operation: &str,
    ) -> Result<T, IoError> {
        let sender = self.sender()?;
        let (result_tx, result_rx) = oneshot::channel();
        sender
            .try_send(make(result_tx))
            .map_err(|e| IoError::write(self.name(), format!("command queue: {}", e)))?;

        let wait = Duration::from_millis(self.shared.config.timeout_ms.max(1));
        tokio::time::timeout(wait, result_rx)
            .await
            .map_err(|_| IoError::timeout(self.name(), operation))?
            .map_err(|_| IoError::not_open(self.name()))?
    }

    /// Drive the DTR line
    pub async fn set_dtr(&self, level: bool) -> Result<(), IoError> {
        self.send_command(|result_tx| SerialCommand::SetDtr { level, result_tx }, "set DTR")
            .await
    }

    /// Drive the RTS line
    pub async fn set_rts(&self, level: bool) -> Result<(), IoError> {
        self.send_command(|result_tx| SerialCommand::SetRts { level, result_tx }, "set RTS")
            .await
    }
}

#[async_trait]
impl Driver for SerialDriver {
    fn bus_type(&self) -> BusType {
        BusType::Uart
    }

    fn core(&self) -> &DriverCore {
        &self.shared.core
    }

    async fn open(&mut self) -> Result<(), IoError> {
        if self.supervisor.is_some() {
            return Ok(());
        }
        self.shared
            .config
            .validate()
            .map_err(|e| IoError::configuration(self.name(), e.to_string()))?;

        let config = self.shared.config.clone();
        let name = self.name().to_string();
        let port = tokio::task::spawn_blocking(move || open_port(&config, &name))
            .await
            .map_err(|e| IoError::connection(self.name(), e.to_string()))??;

        let (command_tx, command_rx) = std_mpsc::sync_channel::<SerialCommand>(32);
        *self.commands.lock().unwrap_or_else(|e| e.into_inner()) = Some(command_tx);

        self.cancel = CancellationToken::new();
        self.shared.connected.store(true, Ordering::SeqCst);
        self.shared.core.mark_opened();

        info!(
            "[serial] Opened {} at {} baud",
            self.shared.config.port, self.shared.config.baud_rate
        );

        self.supervisor = Some(tokio::spawn(supervise(
            self.shared.clone(),
            port,
            command_rx,
            self.cancel.clone(),
        )));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), IoError> {
        self.cancel.cancel();
        if let Some(handle) = self.supervisor.take() {
            if let Err(e) = handle.await {
                warn!("[serial] Supervisor task ended abnormally: {}", e);
            }
        }
        *self.commands.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.core.mark_closed();
        debug!("[serial] Closed {}", self.shared.config.port);
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<usize, IoError> {
        let data = data.to_vec();
        self.send_command(|result_tx| SerialCommand::Write { data, result_tx }, "write")
            .await
    }

    fn is_open(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn validate_configuration(&self) -> ValidationResult {
        self.shared.config.validate().into()
    }
}

impl Drop for SerialDriver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================================
// Port handling
// ============================================================================

fn open_port(config: &UartConfig, name: &str) -> Result<Box<dyn SerialPort>, IoError> {
    let parity = to_serialport_parity(config.parity)
        .ok_or_else(|| IoError::unsupported(name, format!("{:?} parity", config.parity)))?;

    let mut port = serialport::new(&config.port, config.baud_rate)
        .data_bits(to_serialport_data_bits(config.data_bits))
        .stop_bits(to_serialport_stop_bits(config.stop_bits))
        .parity(parity)
        .flow_control(to_serialport_flow_control(config.flow_control))
        .timeout(Duration::from_millis(READ_TIMEOUT_MS))
        .open()
        .map_err(|e| IoError::connection(name, e.to_string()))?;

    if let Some(level) = config.dtr {
        port.write_data_terminal_ready(level)
            .map_err(|e| IoError::connection(name, format!("set DTR: {}", e)))?;
    }
    if let Some(level) = config.rts {
        port.write_request_to_send(level)
            .map_err(|e| IoError::connection(name, format!("set RTS: {}", e)))?;
    }
    Ok(port)
}

/// Run port sessions until cancelled, reconnecting between them if allowed.
async fn supervise(
    shared: Arc<SerialShared>,
    port: Box<dyn SerialPort>,
    commands: std_mpsc::Receiver<SerialCommand>,
    cancel: CancellationToken,
) {
    let mut port = port;
    let mut commands = commands;
    let name = shared.core.name().to_string();
    let interval = Duration::from_millis(shared.config.reconnect_interval_ms.max(1));

    loop {
        let session_shared = shared.clone();
        let session_cancel = cancel.clone();
        let joined = tokio::task::spawn_blocking(move || {
            run_session(port, commands, &session_shared.core, &session_cancel)
        })
        .await;

        let (end, returned) = match joined {
            Ok(result) => result,
            Err(e) => {
                warn!("[serial] Read thread for {} failed: {}", name, e);
                shared.connected.store(false, Ordering::SeqCst);
                shared
                    .core
                    .emit(DriverEvent::Error(IoError::read(&name, e.to_string())))
                    .await;
                shared.core.emit(DriverEvent::Disconnected).await;
                return;
            }
        };
        commands = returned;

        let err = match end {
            SessionEnd::Stopped => return,
            SessionEnd::Failed(err) => err,
        };

        shared.connected.store(false, Ordering::SeqCst);
        warn!("[serial] {}", err);
        shared.core.emit(DriverEvent::Error(err)).await;

        if !shared.config.auto_reconnect {
            shared.core.mark_closed();
            shared.core.emit(DriverEvent::Disconnected).await;
            return;
        }

        port = loop {
            shared.core.emit(DriverEvent::Reconnecting).await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            let config = shared.config.clone();
            let attempt_name = name.clone();
            match tokio::task::spawn_blocking(move || open_port(&config, &attempt_name)).await {
                Ok(Ok(port)) => break port,
                Ok(Err(e)) => debug!("[serial] Reconnect attempt failed: {}", e),
                Err(e) => debug!("[serial] Reconnect attempt panicked: {}", e),
            }
        };

        info!("[serial] Reconnected {}", shared.config.port);
        shared.core.discard_pending();
        shared.connected.store(true, Ordering::SeqCst);
        shared.core.mark_opened();
        shared.core.emit(DriverEvent::Connected).await;
    }
}

/// Blocking read/command loop for one open port.
fn run_session(
    mut port: Box<dyn SerialPort>,
    commands: std_mpsc::Receiver<SerialCommand>,
    core: &DriverCore,
    cancel: &CancellationToken,
) -> (SessionEnd, std_mpsc::Receiver<SerialCommand>) {
    let mut buf = match core.scratch(READ_CHUNK) {
        Ok(buf) => buf,
        Err(e) => return (SessionEnd::Failed(e), commands),
    };

    while !cancel.is_cancelled() {
        // Service queued commands between reads
        while let Ok(cmd) = commands.try_recv() {
            handle_command(port.as_mut(), cmd, core);
        }

        match port.read(&mut buf) {
            Ok(0) => {
                core.flush_blocking();
                return (
                    SessionEnd::Failed(IoError::read(core.name(), "port closed")),
                    commands,
                );
            }
            Ok(n) => core.ingest_blocking(&buf[..n]),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                // Idle: deliver whatever is buffered
                core.flush_blocking();
            }
            Err(e) => {
                core.flush_blocking();
                return (
                    SessionEnd::Failed(IoError::read(core.name(), e.to_string())),
                    commands,
                );
            }
        }
    }

    core.flush_blocking();
    (SessionEnd::Stopped, commands)
}

fn handle_command(port: &mut dyn SerialPort, cmd: SerialCommand, core: &DriverCore) {
    match cmd {
        SerialCommand::Write { data, result_tx } => {
            let result = port
                .write_all(&data)
                .and_then(|_| port.flush())
                .map(|_| data.len())
                .map_err(|e| IoError::write(core.name(), e.to_string()));
            match &result {
                Ok(n) => core.record_sent(*n),
                Err(_) => core.record_error(),
            }
            let _ = result_tx.send(result);
        }
        SerialCommand::SetDtr { level, result_tx } => {
            let result = port
                .write_data_terminal_ready(level)
                .map_err(|e| IoError::write(core.name(), format!("set DTR: {}", e)));
            let _ = result_tx.send(result);
        }
        SerialCommand::SetRts { level, result_tx } => {
            let result = port
                .write_request_to_send(level)
                .map_err(|e| IoError::write(core.name(), format!("set RTS: {}", e)));
            let _ = result_tx.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolManager;

    fn driver(port: &str) -> SerialDriver {
        let (ctx, _rx) = DriverContext::channel(Arc::new(PoolManager::new()));
        SerialDriver::new(
            UartConfig {
                port: port.to_string(),
                ..Default::default()
            },
            &ctx,
        )
    }

    #[test]
    fn test_display_name_and_defaults() {
        let d = driver("/dev/ttyUSB0");
        assert_eq!(d.display_name(), "serial(/dev/ttyUSB0)");
        assert_eq!(d.bus_type(), BusType::Uart);
        assert!(!d.is_open());
        assert!(!d.is_writable());
        assert_eq!(d.buffer_size(), crate::io::DEFAULT_DRIVER_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        let mut d = driver("");
        let err = d.open().await.unwrap_err();
        assert!(matches!(err, IoError::Configuration { .. }));
        assert!(!d.validate_configuration().valid);
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let mut d = driver("/dev/wirestream-no-such-port");
        let err = d.open().await.unwrap_err();
        assert!(matches!(err, IoError::Connection { .. }));
        assert!(!d.is_open());
    }

    #[tokio::test]
    async fn test_mark_parity_unsupported() {
        let (ctx, _rx) = DriverContext::channel(Arc::new(PoolManager::new()));
        let mut d = SerialDriver::new(
            UartConfig {
                port: "/dev/ttyS0".to_string(),
                parity: super::super::Parity::Mark,
                ..Default::default()
            },
            &ctx,
        );
        let err = d.open().await.unwrap_err();
        assert!(matches!(err, IoError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_write_and_line_control_require_open_port() {
        let d = driver("/dev/ttyUSB0");
        assert!(matches!(d.write(b"hi").await, Err(IoError::NotOpen { .. })));
        assert!(matches!(d.set_dtr(true).await, Err(IoError::NotOpen { .. })));
        assert!(matches!(d.set_rts(false).await, Err(IoError::NotOpen { .. })));
    }

    #[tokio::test]
    async fn test_close_without_open_is_noop() {
        let mut d = driver("/dev/ttyUSB0");
        assert!(d.close().await.is_ok());
        assert!(!d.is_open());
    }
}
