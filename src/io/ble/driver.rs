// src/io/ble/driver.rs
//
// Bluetooth LE driver on top of a `BleBackend`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BleBackend, BleConfig, BleError, NotificationStream};
use crate::io::driver::{Driver, DriverContext, DriverCore, DriverEvent};
use crate::io::error::{IoError, ValidationResult};
use crate::io::BusType;

/// How often the watchdog checks the link
const WATCHDOG_INTERVAL: Duration = Duration::from_millis(1000);
/// Quiet period after which aggregated notifications are delivered
const IDLE_FLUSH: Duration = Duration::from_millis(50);

struct BleShared {
    config: BleConfig,
    core: Arc<DriverCore>,
    backend: Arc<dyn BleBackend>,
    connected: AtomicBool,
}

impl BleShared {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn uuids(&self) -> Result<(Uuid, Uuid), IoError> {
        self.config
            .uuids()
            .ok_or_else(|| IoError::configuration(self.name(), "invalid service or characteristic UUID"))
    }

    /// Scan, connect, discover and subscribe.
    async fn establish(&self) -> Result<Option<NotificationStream>, IoError> {
        let config = &self.config;
        let name = self.name();
        let (service, characteristic) = self.uuids()?;

        let device = self
            .backend
            .find(&config.device_id, Duration::from_millis(config.scan_timeout_ms))
            .await
            .map_err(|e| IoError::connection(name, e.to_string()))?;
        debug!("[ble] Found {} ({})", device.name, device.id);

        tokio::time::timeout(
            Duration::from_millis(config.connection_timeout_ms),
            self.backend.connect(&config.device_id),
        )
        .await
        .map_err(|_| IoError::timeout(name, "connect"))?
        .map_err(|e| IoError::connection(name, e.to_string()))?;

        let setup = async {
            if config.auto_discover_services {
                self.backend
                    .discover(&config.device_id, service, characteristic)
                    .await?;
            }
            if config.enable_notifications {
                let stream = self
                    .backend
                    .subscribe(&config.device_id, characteristic)
                    .await?;
                return Ok(Some(stream));
            }
            Ok::<_, BleError>(None)
        };

        match setup.await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                let _ = self.backend.disconnect(&config.device_id).await;
                Err(IoError::protocol(name, e.to_string()))
            }
        }
    }
}

pub struct BleDriver {
    shared: Arc<BleShared>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl BleDriver {
    pub fn new(config: BleConfig, backend: Arc<dyn BleBackend>, ctx: &DriverContext) -> Self {
        let core = DriverCore::new(format!("ble({})", config.device_id), ctx);
        BleDriver {
            shared: Arc::new(BleShared {
                config,
                core,
                backend,
                connected: AtomicBool::new(false),
            }),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn config(&self) -> &BleConfig {
        &self.shared.config
    }
}

#[async_trait]
impl Driver for BleDriver {
    fn bus_type(&self) -> BusType {
        BusType::BluetoothLe
    }

    fn core(&self) -> &DriverCore {
        &self.shared.core
    }

    async fn open(&mut self) -> Result<(), IoError> {
        if self.task.is_some() {
            return Ok(());
        }
        let shared = self.shared.clone();
        shared
            .config
            .validate()
            .map_err(|e| IoError::configuration(shared.name(), e.to_string()))?;
        if !shared.backend.is_supported().await {
            return Err(IoError::unsupported(
                shared.name(),
                "Bluetooth LE is not available",
            ));
        }

        let stream = shared.establish().await?;

        self.cancel = CancellationToken::new();
        shared.connected.store(true, Ordering::SeqCst);
        shared.core.mark_opened();
        info!("[ble] Connected to {}", shared.config.device_id);

        self.task = Some(tokio::spawn(session_loop(
            shared,
            stream,
            self.cancel.clone(),
        )));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), IoError> {
        self.cancel.cancel();
        if let Some(handle) = self.task.take() {
            if let Err(e) = handle.await {
                warn!("[ble] Session task ended abnormally: {}", e);
            }
            let _ = self
                .shared
                .backend
                .disconnect(&self.shared.config.device_id)
                .await;
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.core.mark_closed();
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<usize, IoError> {
        if !self.is_open() {
            return Err(IoError::not_open(self.shared.name()));
        }
        let (_, characteristic) = self.shared.uuids()?;
        match self
            .shared
            .backend
            .write(&self.shared.config.device_id, characteristic, data)
            .await
        {
            Ok(()) => {
                self.shared.core.record_sent(data.len());
                Ok(data.len())
            }
            Err(e) => {
                self.shared.core.record_error();
                Err(IoError::write(self.shared.name(), e.to_string()))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn is_readable(&self) -> bool {
        self.is_open() && self.shared.config.enable_notifications
    }

    fn validate_configuration(&self) -> ValidationResult {
        self.shared.config.validate().into()
    }
}

impl Drop for BleDriver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum SessionEnd {
    Stopped,
    Lost,
}

async fn next_notification(stream: &mut Option<NotificationStream>) -> Option<Vec<u8>> {
    match stream.as_mut() {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Forward notifications until the link drops or the driver is closed.
async fn run_session(
    shared: &BleShared,
    mut stream: Option<NotificationStream>,
    cancel: &CancellationToken,
) -> SessionEnd {
    let core = &shared.core;
    let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
    watchdog.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                core.flush().await;
                return SessionEnd::Stopped;
            }
            _ = watchdog.tick() => {
                if !shared.backend.is_connected(&shared.config.device_id).await {
                    core.flush().await;
                    return SessionEnd::Lost;
                }
            }
            item = next_notification(&mut stream) => match item {
                Some(data) => core.ingest(&data).await,
                None => {
                    core.flush().await;
                    return SessionEnd::Lost;
                }
            },
            _ = tokio::time::sleep(IDLE_FLUSH) => core.flush().await,
        }
    }
}

async fn session_loop(
    shared: Arc<BleShared>,
    stream: Option<NotificationStream>,
    cancel: CancellationToken,
) {
    let core = &shared.core;
    let interval = Duration::from_millis(shared.config.reconnect_interval_ms.max(1));
    let mut stream = stream;

    loop {
        match run_session(&shared, stream, &cancel).await {
            SessionEnd::Stopped => return,
            SessionEnd::Lost => {}
        }
        shared.connected.store(false, Ordering::SeqCst);
        warn!("[ble] Peripheral {} disconnected unexpectedly", shared.config.device_id);

        if !shared.config.auto_reconnect {
            core.mark_closed();
            core.emit(DriverEvent::Disconnected).await;
            return;
        }

        stream = loop {
            core.emit(DriverEvent::Reconnecting).await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            match shared.establish().await {
                Ok(stream) => break stream,
                Err(e) => debug!("[ble] Reconnect attempt failed: {}", e),
            }
        };

        info!("[ble] Reconnected to {}", shared.config.device_id);
        core.discard_pending();
        shared.connected.store(true, Ordering::SeqCst);
        core.mark_opened();
        core.emit(DriverEvent::Connected).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::mock::ScriptedBleBackend;
    use crate::pool::PoolManager;
    use tokio::sync::mpsc;

    fn config() -> BleConfig {
        BleConfig {
            device_id: "dev-1".to_string(),
            service_uuid: "180D".to_string(),
            characteristic_uuid: "2A37".to_string(),
            reconnect_interval_ms: 50,
            ..Default::default()
        }
    }

    fn driver(
        config: BleConfig,
        backend: Arc<dyn BleBackend>,
    ) -> (BleDriver, mpsc::Receiver<DriverEvent>) {
        let (ctx, rx) = DriverContext::channel(Arc::new(PoolManager::new()));
        (BleDriver::new(config, backend, &ctx), rx)
    }

    async fn next_event(rx: &mut mpsc::Receiver<DriverEvent>) -> DriverEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_open_unsupported() {
        let (mut d, _rx) = driver(config(), Arc::new(super::super::UnsupportedBackend));
        let err = d.open().await.unwrap_err();
        assert!(matches!(err, IoError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_open_device_not_found() {
        let backend = Arc::new(ScriptedBleBackend::new(&[]));
        let (mut d, _rx) = driver(config(), backend);
        let err = d.open().await.unwrap_err();
        assert!(matches!(err, IoError::Connection { .. }));
        assert!(!d.is_open());
    }

    #[tokio::test]
    async fn test_missing_characteristic_fails_discovery() {
        let backend = Arc::new(ScriptedBleBackend::new(&["dev-1"]));
        backend.set_has_characteristic(false);
        let (mut d, _rx) = driver(config(), backend.clone());
        let err = d.open().await.unwrap_err();
        assert!(matches!(err, IoError::Protocol { .. }));
        assert!(!backend.is_linked());
    }

    #[tokio::test]
    async fn test_notifications_and_writes() {
        let backend = Arc::new(ScriptedBleBackend::new(&["dev-1"]));
        let (mut d, mut rx) = driver(config(), backend.clone());
        d.open().await.unwrap();
        assert!(d.is_open());
        assert!(d.is_readable());

        backend.notify(b"hr:72\n");
        assert_eq!(next_event(&mut rx).await, DriverEvent::Data(b"hr:72\n".to_vec()));

        assert_eq!(d.write(&[0x01]).await.unwrap(), 1);
        assert_eq!(backend.writes(), vec![vec![0x01]]);

        d.close().await.unwrap();
        assert!(!d.is_open());
        assert!(!backend.is_linked());
        assert!(matches!(d.write(&[0x01]).await, Err(IoError::NotOpen { .. })));
    }

    #[tokio::test]
    async fn test_link_loss_reconnects() {
        let backend = Arc::new(ScriptedBleBackend::new(&["dev-1"]));
        let (mut d, mut rx) = driver(config(), backend.clone());
        d.open().await.unwrap();
        assert_eq!(backend.connect_count(), 1);

        backend.drop_link();
        assert_eq!(next_event(&mut rx).await, DriverEvent::Reconnecting);
        assert_eq!(next_event(&mut rx).await, DriverEvent::Connected);
        assert_eq!(backend.connect_count(), 2);
        assert!(d.is_open());

        backend.notify(b"back");
        assert_eq!(next_event(&mut rx).await, DriverEvent::Data(b"back".to_vec()));
        d.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_link_loss_without_reconnect() {
        let backend = Arc::new(ScriptedBleBackend::new(&["dev-1"]));
        let cfg = BleConfig {
            auto_reconnect: false,
            ..config()
        };
        let (mut d, mut rx) = driver(cfg, backend.clone());
        d.open().await.unwrap();

        backend.drop_link();
        assert_eq!(next_event(&mut rx).await, DriverEvent::Disconnected);
        assert!(!d.is_open());
    }
}
