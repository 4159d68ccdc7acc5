// src/io/manager.rs
//
// Connection manager.
//
// Owns at most one driver at a time and the connection state machine around
// it. Driver events are pumped through frame extraction (on the worker pool
// when threaded extraction is on, inline otherwise) and everything is
// published as `IoEvent`s on a broadcast channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::driver::{Driver, DriverContext, DriverEvent, DriverStats};
use super::error::{ConfigErrors, IoError};
use super::factory::{DiscoveredDevice, DriverFactory};
use super::{now_ms, BusType, CommunicationStatistics, ConnectionState, DeviceConfig, IoEvent};
use crate::context::Context;
use crate::framing::{
    ExtractorStats, FrameDetectionConfig, FrameDetectionUpdate, FrameExtractor, RawFrame,
};
use crate::pool::{PoolManager, Pooled};
use crate::workers::{ExtractedChunk, WorkerError, WorkerPool, WorkerPoolStats};

/// Capacity of the `IoEvent` broadcast channel
pub const EVENT_CAPACITY: usize = 1024;

const STATISTICS_INTERVAL: Duration = Duration::from_secs(1);

/// Worker deadline for one chunk before falling back to inline extraction
const WORKER_EXTRACTION_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Config(#[from] ConfigErrors),

    #[error("not connected")]
    NotConnected,

    #[error("connection manager destroyed")]
    Destroyed,

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

// ============================================================================
// Shared state
// ============================================================================

struct Status {
    state: ConnectionState,
    /// `None` once the manager is destroyed and the record went back to its pool
    statistics: Option<Pooled<CommunicationStatistics>>,
    connected_at: Option<Instant>,
}

/// State reachable from the manager, the pump task and the statistics tick.
struct Shared {
    events: broadcast::Sender<IoEvent>,
    status: Mutex<Status>,
    extractor: Mutex<FrameExtractor>,
    pools: Arc<PoolManager>,
    workers: Option<WorkerPool>,
    paused: AtomicBool,
    threaded: AtomicBool,
    /// Bumped whenever buffered bytes are discarded, so a worker result that
    /// raced the discard does not bring them back
    buffer_epoch: AtomicU64,
    /// Set while the frame pool is exhausted; one warning per episode
    frame_pool_exhausted: AtomicBool,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn extractor(&self) -> MutexGuard<'_, FrameExtractor> {
        self.extractor.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, event: IoEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn update_stats(&self, f: impl FnOnce(&mut CommunicationStatistics)) {
        if let Some(stats) = self.status().statistics.as_mut() {
            f(stats);
        }
    }

    /// Move to `next`. A repeated Reconnecting is a new retry and is
    /// published again; other self-transitions are ignored.
    fn set_state(&self, next: ConnectionState) {
        {
            let mut status = self.status();
            let prev = status.state;
            if prev == next && next != ConnectionState::Reconnecting {
                return;
            }
            if prev == ConnectionState::Reconnecting && next == ConnectionState::Connected {
                if let Some(stats) = status.statistics.as_mut() {
                    stats.reconnections += 1;
                }
            }
            status.connected_at = match next {
                ConnectionState::Connected => Some(Instant::now()),
                _ => None,
            };
            status.state = next;
            debug!("[manager] State {:?} -> {:?}", prev, next);
        }
        self.publish(IoEvent::StateChanged(next));
    }

    fn report_error(&self, message: String) {
        error!("[manager] {}", message);
        self.update_stats(|s| s.errors += 1);
        self.publish(IoEvent::Error(message));
    }

    fn warning(&self, message: String) {
        warn!("[manager] {}", message);
        self.publish(IoEvent::Warning(message));
    }

    fn snapshot(&self) -> CommunicationStatistics {
        let mut status = self.status();
        let uptime_ms = status
            .connected_at
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        match status.statistics.as_mut() {
            Some(stats) => {
                stats.uptime_ms = uptime_ms;
                (**stats).clone()
            }
            None => CommunicationStatistics::default(),
        }
    }

    /// Drop buffered bytes and restart sequence numbering.
    fn reset_extraction(&self) {
        self.buffer_epoch.fetch_add(1, Ordering::SeqCst);
        self.extractor().reset();
    }

    fn threaded_workers(&self) -> Option<&WorkerPool> {
        if self.threaded.load(Ordering::Relaxed) {
            self.workers.as_ref()
        } else {
            None
        }
    }

    async fn handle_driver_event(&self, event: DriverEvent) {
        match event {
            DriverEvent::Data(data) => self.receive(data).await,
            DriverEvent::Connected => {
                self.reset_extraction();
                self.set_state(ConnectionState::Connected);
                info!("[manager] Connection restored");
            }
            DriverEvent::Reconnecting => self.set_state(ConnectionState::Reconnecting),
            DriverEvent::Disconnected => {
                self.report_error("Connection lost".to_string());
                self.set_state(ConnectionState::Error);
            }
            DriverEvent::Error(e) => self.report_error(e.to_string()),
        }
    }

    async fn receive(&self, data: Vec<u8>) {
        let paused = self.paused.load(Ordering::Relaxed);
        let timestamp = now_ms();
        self.update_stats(|s| s.bytes_received += data.len() as u64);
        let data = Arc::new(data);
        self.publish(IoEvent::RawDataReceived {
            data: data.clone(),
            timestamp,
        });

        if paused {
            return;
        }
        for frame in self.extract(&data).await {
            self.publish_frame(frame);
        }
    }

    /// Extract frames from the buffered bytes plus `data`.
    ///
    /// The partial tail always lives in the manager's extractor. On the
    /// threaded path it travels to a worker with the chunk and comes back
    /// unconsumed, so switching paths or losing a worker never splits a
    /// frame.
    async fn extract(&self, data: &[u8]) -> Vec<RawFrame> {
        let mut fallback = None;
        if let Some(workers) = self.threaded_workers() {
            let epoch = self.buffer_epoch.load(Ordering::SeqCst);
            let pending = self.extractor().take_pending(data);
            match workers
                .extract_chunk(pending.clone(), WORKER_EXTRACTION_TIMEOUT)
                .await
            {
                Ok(ExtractedChunk {
                    mut frames,
                    consumed,
                    checksum_errors,
                }) => {
                    {
                        let mut extractor = self.extractor();
                        if self.buffer_epoch.load(Ordering::SeqCst) == epoch {
                            extractor.restore(pending.get(consumed..).unwrap_or_default());
                        }
                        extractor.adopt(&mut frames, checksum_errors);
                    }
                    self.count_checksum_errors(checksum_errors);
                    return frames;
                }
                Err(e) => {
                    match &e {
                        WorkerError::Destroyed => {}
                        WorkerError::Busy { .. } => {
                            debug!("[manager] {}, extracting inline", e)
                        }
                        _ => self.warning(format!(
                            "Worker extraction failed, extracting inline: {}",
                            e
                        )),
                    }
                    if self.buffer_epoch.load(Ordering::SeqCst) == epoch {
                        fallback = Some(pending);
                    }
                }
            }
        }

        // After a failed hand-off the extractor is empty and `pending`
        // already holds the old tail plus `data`
        let input = fallback.as_deref().unwrap_or(data);
        let (frames, checksum_errors) = {
            let mut extractor = self.extractor();
            let before = extractor.checksum_errors();
            let frames = extractor.push(input);
            (frames, extractor.checksum_errors() - before)
        };
        self.count_checksum_errors(checksum_errors);
        frames
    }

    fn count_checksum_errors(&self, n: u64) {
        if n > 0 {
            debug!("[manager] Dropped {} frame(s) on checksum", n);
            self.update_stats(|s| s.errors += n);
        }
    }

    /// Copy `frame` into a pooled slot, reusing the slot's allocation.
    fn publish_frame(&self, frame: RawFrame) {
        let pooled = match self.pools.frames().acquire() {
            Ok(mut slot) => {
                if self.frame_pool_exhausted.swap(false, Ordering::Relaxed) {
                    info!("[manager] Frame pool available again");
                }
                slot.data.clear();
                slot.data.extend_from_slice(&frame.data);
                slot.timestamp = frame.timestamp;
                slot.sequence = frame.sequence;
                slot.checksum_valid = frame.checksum_valid;
                slot
            }
            Err(e) => {
                if !self.frame_pool_exhausted.swap(true, Ordering::Relaxed) {
                    self.warning(format!("{}; delivering frames outside the pool", e));
                }
                Pooled::detached(frame)
            }
        };
        self.update_stats(|s| s.frames_received += 1);
        self.publish(IoEvent::FrameReceived(Arc::new(pooled)));
    }
}

// ============================================================================
// Background tasks
// ============================================================================

/// Forward one driver's events until it is replaced or closed.
async fn pump(
    shared: Arc<Shared>,
    mut events: mpsc::Receiver<DriverEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        shared.handle_driver_event(event).await;
    }
}

async fn publish_statistics(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(STATISTICS_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let stats = shared.snapshot();
                shared.publish(IoEvent::StatisticsUpdated(stats));
            }
        }
    }
}

// ============================================================================
// Connection manager
// ============================================================================

struct Connection {
    driver: Box<dyn Driver>,
    pump: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Owns one transport connection and its frame pipeline.
///
/// Must be created inside a tokio runtime.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    factory: Arc<DriverFactory>,
    connection: tokio::sync::Mutex<Option<Connection>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    destroyed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(ctx: &Context) -> Self {
        let worker_config = ctx.worker_config().clone();
        let framing = ctx.frame_config().clone();

        let workers = match WorkerPool::new(worker_config.clone()) {
            Ok(pool) => {
                if framing != FrameDetectionConfig::default() {
                    if let Err(e) = pool.configure_in_background(framing.clone()) {
                        warn!("[manager] Could not configure workers: {}", e);
                    }
                }
                Some(pool)
            }
            Err(e) => {
                warn!("[manager] Worker pool unavailable, extracting inline: {}", e);
                None
            }
        };

        let statistics = ctx.pools().statistics().acquire().unwrap_or_else(|e| {
            warn!("[manager] {}", e);
            Pooled::detached(CommunicationStatistics::default())
        });

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            events,
            status: Mutex::new(Status {
                state: ConnectionState::Disconnected,
                statistics: Some(statistics),
                connected_at: None,
            }),
            extractor: Mutex::new(FrameExtractor::new(framing)),
            pools: ctx.pools().clone(),
            workers,
            paused: AtomicBool::new(false),
            threaded: AtomicBool::new(worker_config.threaded_extraction),
            buffer_epoch: AtomicU64::new(0),
            frame_pool_exhausted: AtomicBool::new(false),
        });

        let cancel = CancellationToken::new();
        let ticker = tokio::spawn(publish_statistics(shared.clone(), cancel.child_token()));

        ConnectionManager {
            shared,
            factory: ctx.factory().clone(),
            connection: tokio::sync::Mutex::new(None),
            ticker: Mutex::new(Some(ticker)),
            cancel,
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IoEvent> {
        self.shared.events.subscribe()
    }

    fn ensure_alive(&self) -> Result<(), ManagerError> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(ManagerError::Destroyed)
        } else {
            Ok(())
        }
    }

    /// Build, validate and open a driver for `config`, replacing any active
    /// connection.
    pub async fn connect(&self, config: DeviceConfig) -> Result<(), ManagerError> {
        self.ensure_alive()?;
        let mut connection = self.connection.lock().await;
        if let Some(active) = connection.take() {
            info!("[manager] Closing active connection before connecting");
            if let Err(e) = self.teardown(active).await {
                self.shared.report_error(e.to_string());
            }
        }

        let device = config.describe();
        self.shared.set_state(ConnectionState::Connecting);

        let (ctx, driver_events) = DriverContext::channel(self.shared.pools.clone());
        let mut driver = match self.factory.create_driver(config, &ctx) {
            Ok(driver) => driver,
            Err(errors) => {
                self.shared.set_state(ConnectionState::Error);
                self.shared.report_error(format!("{}: {}", device, errors));
                return Err(errors.into());
            }
        };

        if let Err(e) = driver.open().await {
            self.shared.set_state(ConnectionState::Error);
            self.shared.report_error(e.to_string());
            return Err(e.into());
        }

        self.shared.reset_extraction();
        let cancel = self.cancel.child_token();
        let pump = tokio::spawn(pump(self.shared.clone(), driver_events, cancel.clone()));
        *connection = Some(Connection {
            driver,
            pump,
            cancel,
        });
        self.shared.set_state(ConnectionState::Connected);
        info!("[manager] Connected to {}", device);
        Ok(())
    }

    /// Close the active driver. Does nothing when not connected.
    pub async fn disconnect(&self) -> Result<(), ManagerError> {
        let mut connection = self.connection.lock().await;
        match connection.take() {
            Some(active) => self.teardown(active).await.map_err(ManagerError::from),
            None => Ok(()),
        }
    }

    async fn teardown(&self, active: Connection) -> Result<(), IoError> {
        let Connection {
            mut driver,
            pump,
            cancel,
        } = active;
        let name = driver.display_name();

        cancel.cancel();
        let _ = pump.await;
        self.shared.set_state(ConnectionState::Disconnected);

        let closed = driver.close().await;
        drop(driver);
        self.shared.reset_extraction();

        match &closed {
            Ok(()) => info!("[manager] Disconnected from {}", name),
            Err(e) => warn!("[manager] Error closing {}: {}", name, e),
        }
        closed
    }

    /// Write raw bytes to the active driver.
    pub async fn write_data(&self, data: &[u8]) -> Result<usize, ManagerError> {
        let connection = self.connection.lock().await;
        let driver = match connection.as_ref() {
            Some(active) if active.driver.is_writable() => &active.driver,
            _ => return Err(ManagerError::NotConnected),
        };

        match driver.write(data).await {
            Ok(n) => {
                self.shared.update_stats(|s| {
                    s.bytes_sent += n as u64;
                    s.frames_sent += 1;
                });
                Ok(n)
            }
            Err(e) => {
                self.shared.report_error(e.to_string());
                Err(e.into())
            }
        }
    }

    /// While paused, incoming bytes are counted and published raw but no
    /// frames are extracted.
    pub fn set_paused(&self, paused: bool) {
        if self.shared.paused.swap(paused, Ordering::SeqCst) != paused {
            let message = if paused {
                "Data processing paused"
            } else {
                "Data processing resumed"
            };
            self.shared.warning(message.to_string());
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Merge `update` into the framing configuration, push it to the
    /// workers and drop any partially buffered frame.
    pub async fn update_frame_config(
        &self,
        update: FrameDetectionUpdate,
    ) -> Result<FrameDetectionConfig, ManagerError> {
        self.ensure_alive()?;
        let config = {
            let mut extractor = self.shared.extractor();
            let mut config = extractor.config().clone();
            config.merge(update);
            extractor.configure(config.clone());
            extractor.clear_buffer();
            self.shared.buffer_epoch.fetch_add(1, Ordering::SeqCst);
            config
        };

        if let Some(workers) = &self.shared.workers {
            if let Err(e) = workers.configure_workers(config.clone()).await {
                if !e.is_destroyed() {
                    self.shared
                        .warning(format!("Failed to configure workers: {}", e));
                }
            }
        }

        info!("[manager] Frame detection set to {:?}", config.mode);
        Ok(config)
    }

    pub fn frame_config(&self) -> FrameDetectionConfig {
        self.shared.extractor().config().clone()
    }

    /// Statistics of the partial-frame buffer shared by both extraction paths
    pub fn extraction_stats(&self) -> ExtractorStats {
        self.shared.extractor().stats()
    }

    /// Switch between worker and inline extraction. Both paths share the
    /// manager's partial-frame buffer, so a switch never splits a frame.
    pub fn set_threaded_extraction(&self, enabled: bool) {
        self.shared.threaded.store(enabled, Ordering::SeqCst);
        debug!(
            "[manager] Threaded extraction {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn is_threaded_extraction(&self) -> bool {
        self.shared.threaded.load(Ordering::SeqCst) && self.shared.workers.is_some()
    }

    pub async fn reset_workers(&self) -> Result<(), ManagerError> {
        match &self.shared.workers {
            Some(workers) => Ok(workers.reset_workers().await?),
            None => Err(WorkerError::NoWorkers.into()),
        }
    }

    pub fn worker_stats(&self) -> Option<WorkerPoolStats> {
        self.shared.workers.as_ref().map(|w| w.stats())
    }

    pub async fn available_devices(
        &self,
        bus_type: BusType,
    ) -> Result<Vec<DiscoveredDevice>, ManagerError> {
        Ok(self.factory.discover_devices(bus_type).await?)
    }

    pub fn validate_config(&self, config: &DeviceConfig) -> Result<(), ConfigErrors> {
        self.factory.validate(config)
    }

    /// Current counters, with uptime measured now
    pub fn statistics(&self) -> CommunicationStatistics {
        self.shared.snapshot()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Counters kept by the active driver itself
    pub async fn driver_stats(&self) -> Option<DriverStats> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|active| active.driver.stats())
    }

    /// Disconnect, stop background tasks, destroy the worker pool and hand
    /// the statistics record back to its pool. Later calls are no-ops.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.disconnect().await {
            warn!("[manager] Error while disconnecting: {}", e);
        }

        self.cancel.cancel();
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(ticker) = ticker {
            let _ = ticker.await;
        }
        if let Some(workers) = &self.shared.workers {
            workers.destroy();
        }
        self.shared.status().statistics.take();
        info!("[manager] Destroyed");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // Stops the pump and statistics tasks; drivers cancel their own loops
        self.cancel.cancel();
        if let Some(workers) = &self.shared.workers {
            workers.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksums::ChecksumAlgorithm;
    use crate::context::ContextConfig;
    use crate::framing::FrameDetectionMode;
    use crate::io::mock::MockControl;
    use crate::io::{SharedFrame, UartConfig};
    use crate::pool::RAW_FRAME_POOL;
    use crate::workers::{WorkerCommand, WorkerPoolConfig};
    use tokio::sync::broadcast::error::RecvError;

    fn setup() -> (Context, MockControl, ConnectionManager) {
        let ctx = Context::new(ContextConfig {
            workers: WorkerPoolConfig {
                max_workers: Some(2),
                ..Default::default()
            },
            ..Default::default()
        });
        let mock = MockControl::new();
        mock.install(ctx.factory(), BusType::Uart);
        let manager = ConnectionManager::new(&ctx);
        (ctx, mock, manager)
    }

    fn mock_config() -> DeviceConfig {
        DeviceConfig::Uart(UartConfig {
            port: "/dev/mock0".to_string(),
            ..Default::default()
        })
    }

    /// Next event other than a statistics tick
    async fn next_event(rx: &mut broadcast::Receiver<IoEvent>) -> IoEvent {
        loop {
            match tokio::time::timeout(Duration::from_secs(3), rx.recv())
                .await
                .expect("timed out waiting for an event")
            {
                Ok(IoEvent::StatisticsUpdated(_)) | Err(RecvError::Lagged(_)) => continue,
                Ok(event) => return event,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    }

    async fn next_state(rx: &mut broadcast::Receiver<IoEvent>) -> ConnectionState {
        loop {
            if let IoEvent::StateChanged(state) = next_event(rx).await {
                return state;
            }
        }
    }

    async fn next_frames(rx: &mut broadcast::Receiver<IoEvent>, n: usize) -> Vec<SharedFrame> {
        let mut frames = Vec::new();
        while frames.len() < n {
            if let IoEvent::FrameReceived(frame) = next_event(rx).await {
                frames.push(frame);
            }
        }
        frames
    }

    #[tokio::test]
    async fn test_connect_extracts_frames() {
        let (_ctx, mock, manager) = setup();
        let mut rx = manager.subscribe();

        manager.connect(mock_config()).await.unwrap();
        assert_eq!(next_state(&mut rx).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut rx).await, ConnectionState::Connected);
        assert!(manager.is_connected());
        assert_eq!(mock.opens(), 1);

        mock.feed(b"a,1\nb,2\nc,3\n").await;
        match next_event(&mut rx).await {
            IoEvent::RawDataReceived { data, .. } => assert_eq!(data.as_slice(), b"a,1\nb,2\nc,3\n"),
            other => panic!("unexpected event {:?}", other),
        }
        let frames = next_frames(&mut rx, 3).await;
        let data: Vec<&[u8]> = frames.iter().map(|f| f.data.as_slice()).collect();
        assert_eq!(data, vec![&b"a,1"[..], b"b,2", b"c,3"]);
        let sequences: Vec<u64> = frames.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);

        let stats = manager.statistics();
        assert_eq!(stats.bytes_received, 12);
        assert_eq!(stats.frames_received, 3);
        assert_eq!(manager.extraction_stats().buffered, 0);
    }

    #[tokio::test]
    async fn test_inline_extraction_across_chunks() {
        let (_ctx, mock, manager) = setup();
        manager.set_threaded_extraction(false);
        assert!(!manager.is_threaded_extraction());
        let mut rx = manager.subscribe();
        manager.connect(mock_config()).await.unwrap();

        mock.feed(b"{x:").await;
        mock.feed(b"1}\n").await;
        let frames = next_frames(&mut rx, 1).await;
        assert_eq!(frames[0].data, b"{x:1}");
        assert_eq!(frames[0].sequence, 1);
    }

    #[tokio::test]
    async fn test_threaded_extraction_across_chunks() {
        let (_ctx, mock, manager) = setup();
        assert!(manager.is_threaded_extraction());
        let mut rx = manager.subscribe();
        manager.connect(mock_config()).await.unwrap();

        mock.feed(b"a,1\nb,").await;
        mock.feed(b"2\n").await;
        let frames = next_frames(&mut rx, 2).await;
        assert_eq!(frames[0].data, b"a,1");
        assert_eq!(frames[1].data, b"b,2");
        assert_eq!(frames[1].sequence, 2);
        assert_eq!(manager.worker_stats().unwrap().completed_requests, 2);
    }

    #[tokio::test]
    async fn test_switching_paths_keeps_partial_frame() {
        let (_ctx, mock, manager) = setup();
        let mut rx = manager.subscribe();
        manager.connect(mock_config()).await.unwrap();

        mock.feed(b"a,1\nb,").await;
        assert_eq!(next_frames(&mut rx, 1).await[0].data, b"a,1");
        assert_eq!(manager.extraction_stats().buffered, 2);

        manager.set_threaded_extraction(false);
        mock.feed(b"2\nc,").await;
        let frame = next_frames(&mut rx, 1).await.remove(0);
        assert_eq!(frame.data, b"b,2");
        assert_eq!(frame.sequence, 2);

        manager.set_threaded_extraction(true);
        mock.feed(b"3\n").await;
        let frame = next_frames(&mut rx, 1).await.remove(0);
        assert_eq!(frame.data, b"c,3");
        assert_eq!(frame.sequence, 3);
    }

    #[tokio::test]
    async fn test_worker_failure_keeps_partial_frame() {
        let (_ctx, mock, manager) = setup();
        let mut rx = manager.subscribe();
        manager.connect(mock_config()).await.unwrap();

        mock.feed(b"a,1\nb,").await;
        assert_eq!(next_frames(&mut rx, 1).await[0].data, b"a,1");

        let workers = manager.shared.workers.as_ref().unwrap();
        let err = workers
            .request(WorkerCommand::Panic, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::WorkerFailed { .. }));

        mock.feed(b"2\n").await;
        let frame = next_frames(&mut rx, 1).await.remove(0);
        assert_eq!(frame.data, b"b,2");
        assert_eq!(frame.sequence, 2);
    }

    #[tokio::test]
    async fn test_pooled_frame_keeps_its_allocation() {
        let (ctx, mock, manager) = setup();
        let mut rx = manager.subscribe();
        manager.connect(mock_config()).await.unwrap();

        mock.feed(b"0123456789abcdef\n").await;
        let frame = next_frames(&mut rx, 1).await.remove(0);
        assert!(!frame.is_detached());
        let capacity = frame.data.capacity();
        assert!(capacity >= 16);
        drop(frame);

        // The released slot is the next one handed out
        let slot = ctx.pools().frames().acquire().unwrap();
        assert!(slot.data.is_empty());
        assert_eq!(slot.data.capacity(), capacity);
    }

    #[tokio::test]
    async fn test_frame_pool_exhaustion_warns_once() {
        let (ctx, mock, manager) = setup();
        manager.set_threaded_extraction(false);
        let mut rx = manager.subscribe();
        manager.connect(mock_config()).await.unwrap();

        let held: Vec<_> = (0..RAW_FRAME_POOL.max_size)
            .map(|_| ctx.pools().frames().acquire().unwrap())
            .collect();

        mock.feed(b"a\nb\nc\n").await;
        let mut warnings = 0;
        let mut frames = Vec::new();
        while frames.len() < 3 {
            match next_event(&mut rx).await {
                IoEvent::Warning(message) => {
                    assert!(message.contains("exhausted"));
                    warnings += 1;
                }
                IoEvent::FrameReceived(frame) => frames.push(frame),
                _ => {}
            }
        }
        assert_eq!(warnings, 1);
        assert!(frames.iter().all(|f| f.is_detached()));
        assert_eq!(manager.statistics().frames_received, 3);

        drop(held);
        mock.feed(b"d\n").await;
        let frame = next_frames(&mut rx, 1).await.remove(0);
        assert_eq!(frame.data, b"d");
        assert!(!frame.is_detached());
    }

    #[tokio::test]
    async fn test_frames_return_to_pool_when_dropped() {
        let (ctx, mock, manager) = setup();
        let mut rx = manager.subscribe();
        manager.connect(mock_config()).await.unwrap();

        mock.feed(b"one\n").await;
        let frames = next_frames(&mut rx, 1).await;
        assert!(!frames[0].is_detached());
        let used = ctx.pools().frames().stats().used;
        assert!(used >= 1);

        drop(frames);
        drop(rx);
        assert_eq!(ctx.pools().frames().stats().used, used - 1);
    }

    #[tokio::test]
    async fn test_paused_counts_bytes_without_frames() {
        let (_ctx, mock, manager) = setup();
        let mut rx = manager.subscribe();
        manager.connect(mock_config()).await.unwrap();

        manager.set_paused(true);
        assert!(manager.is_paused());
        loop {
            if let IoEvent::Warning(message) = next_event(&mut rx).await {
                assert_eq!(message, "Data processing paused");
                break;
            }
        }

        mock.feed(b"a\nb\n").await;
        assert!(matches!(
            next_event(&mut rx).await,
            IoEvent::RawDataReceived { .. }
        ));

        manager.set_paused(false);
        match next_event(&mut rx).await {
            IoEvent::Warning(message) => assert_eq!(message, "Data processing resumed"),
            other => panic!("expected resume warning, got {:?}", other),
        }

        mock.feed(b"c\n").await;
        let frames = next_frames(&mut rx, 1).await;
        assert_eq!(frames[0].data, b"c");

        let stats = manager.statistics();
        assert_eq!(stats.bytes_received, 6);
        assert_eq!(stats.frames_received, 1);
    }

    #[tokio::test]
    async fn test_write_data() {
        let (_ctx, mock, manager) = setup();
        assert_eq!(
            manager.write_data(b"AT\r\n").await,
            Err(ManagerError::NotConnected)
        );

        manager.connect(mock_config()).await.unwrap();
        assert_eq!(manager.write_data(b"AT\r\n").await, Ok(4));
        assert_eq!(mock.writes(), vec![b"AT\r\n".to_vec()]);

        let stats = manager.statistics();
        assert_eq!(stats.bytes_sent, 4);
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(manager.driver_stats().await.unwrap().bytes_sent, 4);
    }

    #[tokio::test]
    async fn test_open_failure_moves_to_error() {
        let (_ctx, mock, manager) = setup();
        let mut rx = manager.subscribe();
        mock.fail_open(true);

        let err = manager.connect(mock_config()).await.unwrap_err();
        assert!(matches!(err, ManagerError::Io(IoError::Connection { .. })));
        assert_eq!(next_state(&mut rx).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut rx).await, ConnectionState::Error);
        match next_event(&mut rx).await {
            IoEvent::Error(message) => assert!(message.contains("scripted open failure")),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(manager.statistics().errors, 1);
        assert_eq!(manager.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_invalid_config_never_opens() {
        let (_ctx, mock, manager) = setup();
        let config = DeviceConfig::Uart(UartConfig::default());
        assert_eq!(
            manager.validate_config(&config).unwrap_err().messages(),
            &["Port is required".to_string()]
        );

        match manager.connect(config).await {
            Err(ManagerError::Config(errors)) => {
                assert_eq!(errors.messages(), &["Port is required".to_string()])
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(mock.opens(), 0);
        assert_eq!(manager.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_reconnect_bookkeeping() {
        let (_ctx, mock, manager) = setup();
        manager.connect(mock_config()).await.unwrap();
        let mut rx = manager.subscribe();

        mock.feed(b"before\n").await;
        assert_eq!(next_frames(&mut rx, 1).await[0].sequence, 1);

        mock.send(DriverEvent::Reconnecting).await;
        mock.send(DriverEvent::Reconnecting).await;
        mock.send(DriverEvent::Connected).await;
        assert_eq!(next_state(&mut rx).await, ConnectionState::Reconnecting);
        assert_eq!(next_state(&mut rx).await, ConnectionState::Reconnecting);
        assert_eq!(next_state(&mut rx).await, ConnectionState::Connected);
        assert_eq!(manager.statistics().reconnections, 1);

        // Numbering restarts on the new link
        mock.feed(b"after\n").await;
        let frame = next_frames(&mut rx, 1).await.remove(0);
        assert_eq!(frame.data, b"after");
        assert_eq!(frame.sequence, 1);

        // A failed attempt never counts
        mock.send(DriverEvent::Reconnecting).await;
        assert_eq!(next_state(&mut rx).await, ConnectionState::Reconnecting);
        assert_eq!(manager.statistics().reconnections, 1);
    }

    #[tokio::test]
    async fn test_driver_errors_are_counted() {
        let (_ctx, mock, manager) = setup();
        manager.connect(mock_config()).await.unwrap();
        let mut rx = manager.subscribe();

        mock.send(DriverEvent::Error(IoError::read("mock(0)", "framing error")))
            .await;
        match next_event(&mut rx).await {
            IoEvent::Error(message) => assert!(message.contains("framing error")),
            other => panic!("unexpected event {:?}", other),
        }

        mock.send(DriverEvent::Disconnected).await;
        assert_eq!(next_state(&mut rx).await, ConnectionState::Error);
        assert_eq!(manager.statistics().errors, 2);
    }

    #[tokio::test]
    async fn test_checksum_failures_are_counted_not_emitted() {
        let (_ctx, mock, manager) = setup();
        manager
            .update_frame_config(FrameDetectionUpdate {
                checksum_algorithm: Some(ChecksumAlgorithm::Xor),
                ..Default::default()
            })
            .await
            .unwrap();
        manager.connect(mock_config()).await.unwrap();
        let mut rx = manager.subscribe();

        // "ab" xor = 0x03; second frame carries a wrong checksum
        mock.feed(b"ab\x03\nab\x04\n").await;
        let frames = next_frames(&mut rx, 1).await;
        assert_eq!(frames[0].data, b"ab");
        assert!(frames[0].checksum_valid);

        let stats = manager.statistics();
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test]
    async fn test_update_frame_config_clears_buffer() {
        let (_ctx, mock, manager) = setup();
        manager.set_threaded_extraction(false);
        manager.connect(mock_config()).await.unwrap();
        let mut rx = manager.subscribe();

        mock.feed(b"{stale").await;
        for _ in 0..100 {
            if manager.extraction_stats().buffered == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.extraction_stats().buffered, 6);

        let config = manager
            .update_frame_config(FrameDetectionUpdate {
                mode: Some(FrameDetectionMode::StartAndEndDelimiter),
                start_sequence: Some(b"{".to_vec()),
                finish_sequence: Some(b"}".to_vec()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(config.mode, FrameDetectionMode::StartAndEndDelimiter);
        assert_eq!(manager.frame_config(), config);
        assert_eq!(manager.extraction_stats().buffered, 0);

        manager.set_threaded_extraction(true);
        mock.feed(b"{x:1}{y:2}").await;
        let frames = next_frames(&mut rx, 2).await;
        assert_eq!(frames[0].data, b"x:1");
        assert_eq!(frames[1].data, b"y:2");
    }

    #[tokio::test]
    async fn test_disconnect_resets_sequence() {
        let (_ctx, mock, manager) = setup();
        let mut rx = manager.subscribe();
        manager.disconnect().await.unwrap();

        manager.connect(mock_config()).await.unwrap();
        mock.feed(b"a\nb\n").await;
        assert_eq!(next_frames(&mut rx, 2).await[1].sequence, 2);

        manager.disconnect().await.unwrap();
        assert_eq!(mock.closes(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(next_state(&mut rx).await, ConnectionState::Disconnected);

        manager.connect(mock_config()).await.unwrap();
        mock.feed(b"c\n").await;
        assert_eq!(next_frames(&mut rx, 1).await[0].sequence, 1);
    }

    #[tokio::test]
    async fn test_connect_replaces_active_connection() {
        let (_ctx, mock, manager) = setup();
        manager.connect(mock_config()).await.unwrap();
        manager.connect(mock_config()).await.unwrap();
        assert_eq!(mock.opens(), 2);
        assert_eq!(mock.closes(), 1);
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn test_statistics_tick() {
        let (_ctx, _mock, manager) = setup();
        manager.connect(mock_config()).await.unwrap();
        let mut rx = manager.subscribe();

        let stats = loop {
            match tokio::time::timeout(Duration::from_secs(3), rx.recv())
                .await
                .unwrap()
            {
                Ok(IoEvent::StatisticsUpdated(stats)) => break stats,
                _ => continue,
            }
        };
        assert!(stats.uptime_ms > 0);
    }

    #[tokio::test]
    async fn test_destroy() {
        let (ctx, mock, manager) = setup();
        manager.connect(mock_config()).await.unwrap();
        assert_eq!(ctx.pools().statistics().stats().used, 1);

        manager.destroy().await;
        assert_eq!(mock.closes(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(ctx.pools().statistics().stats().used, 0);
        assert_eq!(manager.worker_stats().unwrap().total_workers, 0);
        assert_eq!(
            manager.connect(mock_config()).await,
            Err(ManagerError::Destroyed)
        );
        assert_eq!(
            manager.reset_workers().await,
            Err(ManagerError::Worker(WorkerError::Destroyed))
        );

        // Second destroy is a no-op
        manager.destroy().await;
    }
}
