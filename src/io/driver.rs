// src/io/driver.rs
//
// Common driver contract shared by the serial, network and BLE adapters,
// plus the chunk aggregator and per-driver bookkeeping they all reuse.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use super::error::{IoError, ValidationResult};
use super::{now_ms, BusType};
use crate::pool::{PoolManager, PooledBuffer};

/// Aggregation buffer size used when a driver is created
pub const DEFAULT_DRIVER_BUFFER_SIZE: usize = 8192;

/// Capacity of the driver -> manager event channel
pub const DRIVER_EVENT_CAPACITY: usize = 256;

// ============================================================================
// Events and context
// ============================================================================

/// Signals a driver sends to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// Aggregated bytes read from the transport
    Data(Vec<u8>),
    /// Transport re-established after a reconnect cycle
    Connected,
    /// Transport lost; the driver is retrying
    Reconnecting,
    /// Transport lost and the driver is not retrying
    Disconnected,
    Error(IoError),
}

/// What a driver needs from its owner: somewhere to send events and the
/// shared pools.
#[derive(Clone)]
pub struct DriverContext {
    pub events: mpsc::Sender<DriverEvent>,
    pub pools: Arc<PoolManager>,
}

impl DriverContext {
    /// Create a context together with the receiving end of its event channel.
    pub fn channel(pools: Arc<PoolManager>) -> (Self, mpsc::Receiver<DriverEvent>) {
        let (events, rx) = mpsc::channel(DRIVER_EVENT_CAPACITY);
        (DriverContext { events, pools }, rx)
    }
}

/// Per-driver traffic counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriverStats {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub errors: u64,
    pub uptime_ms: u64,
    pub last_activity_ms: u64,
}

// ============================================================================
// Driver trait
// ============================================================================

/// A transport adapter.
///
/// `open` and `close` take `&mut self`; `write` only needs `&self` so the
/// owner can write while a read loop is running. Incoming bytes are
/// delivered as [`DriverEvent::Data`] through the [`DriverContext`] the
/// driver was built with.
#[async_trait]
pub trait Driver: Send + Sync {
    fn bus_type(&self) -> BusType;

    /// Shared bookkeeping for this driver
    fn core(&self) -> &DriverCore;

    async fn open(&mut self) -> Result<(), IoError>;

    async fn close(&mut self) -> Result<(), IoError>;

    /// Write bytes, returning how many were accepted by the transport.
    async fn write(&self, data: &[u8]) -> Result<usize, IoError>;

    fn is_open(&self) -> bool;

    fn is_readable(&self) -> bool {
        self.is_open()
    }

    fn is_writable(&self) -> bool {
        self.is_open()
    }

    fn validate_configuration(&self) -> ValidationResult;

    fn display_name(&self) -> String {
        self.core().name().to_string()
    }

    fn stats(&self) -> DriverStats {
        self.core().stats()
    }

    fn buffer_size(&self) -> usize {
        self.core().buffer_size()
    }

    /// Resize the aggregation buffer. Zero is ignored.
    fn set_buffer_size(&self, size: usize) {
        self.core().set_buffer_size(size)
    }

    /// Emit whatever the aggregator is holding.
    async fn flush_buffer(&self) {
        self.core().flush().await
    }
}

// ============================================================================
// Chunk aggregation
// ============================================================================

/// Coalesces small reads into larger chunks.
///
/// Bytes accumulate until the buffer reaches 80% of capacity or the next
/// chunk would not fit. Chunks larger than the whole buffer skip it.
#[derive(Debug)]
pub struct ChunkAggregator {
    buffer: Vec<u8>,
    capacity: usize,
}

impl ChunkAggregator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        ChunkAggregator {
            buffer: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        if capacity > 0 {
            self.capacity = capacity;
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk, returning any chunks that are ready to deliver in
    /// arrival order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut ready = Vec::new();
        if chunk.is_empty() {
            return ready;
        }

        if chunk.len() > self.capacity {
            ready.extend(self.flush());
            ready.push(chunk.to_vec());
            return ready;
        }

        if self.buffer.len() + chunk.len() > self.capacity {
            ready.extend(self.flush());
        }
        self.buffer.extend_from_slice(chunk);

        // High-water mark: 80%
        if self.buffer.len() * 5 >= self.capacity * 4 {
            ready.extend(self.flush());
        }
        ready
    }

    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(self.capacity),
        ))
    }
}

// ============================================================================
// Driver bookkeeping
// ============================================================================

/// State every driver carries: its name, event sender, aggregator and
/// counters. Shared with read loops through an `Arc`.
pub struct DriverCore {
    name: String,
    events: mpsc::Sender<DriverEvent>,
    pools: Arc<PoolManager>,
    aggregator: Mutex<ChunkAggregator>,
    opened_at: Mutex<Option<Instant>>,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    errors: AtomicU64,
    last_activity_ms: AtomicU64,
}

impl DriverCore {
    pub fn new(name: impl Into<String>, ctx: &DriverContext) -> Arc<Self> {
        Arc::new(DriverCore {
            name: name.into(),
            events: ctx.events.clone(),
            pools: ctx.pools.clone(),
            aggregator: Mutex::new(ChunkAggregator::new(DEFAULT_DRIVER_BUFFER_SIZE)),
            opened_at: Mutex::new(None),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn aggregator(&self) -> MutexGuard<'_, ChunkAggregator> {
        self.aggregator.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Borrow a read buffer from the shared buffer pool.
    pub fn scratch(&self, len: usize) -> Result<PooledBuffer, IoError> {
        self.pools
            .buffers()
            .acquire(len)
            .map_err(|e| IoError::read(&self.name, e.to_string()))
    }

    pub fn mark_opened(&self) {
        *self.opened_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    pub fn mark_closed(&self) {
        *self.opened_at.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn record_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn record_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Feed bytes read from the transport through the aggregator.
    pub async fn ingest(&self, chunk: &[u8]) {
        self.record_received(chunk.len());
        let ready = self.aggregator().push(chunk);
        for data in ready {
            self.emit(DriverEvent::Data(data)).await;
        }
    }

    /// [`DriverCore::ingest`] for read loops running on a blocking thread.
    pub fn ingest_blocking(&self, chunk: &[u8]) {
        self.record_received(chunk.len());
        let ready = self.aggregator().push(chunk);
        for data in ready {
            self.emit_blocking(DriverEvent::Data(data));
        }
    }

    pub async fn flush(&self) {
        let pending = self.aggregator().flush();
        if let Some(data) = pending {
            self.emit(DriverEvent::Data(data)).await;
        }
    }

    pub fn flush_blocking(&self) {
        let pending = self.aggregator().flush();
        if let Some(data) = pending {
            self.emit_blocking(DriverEvent::Data(data));
        }
    }

    /// Drop anything the aggregator is holding.
    pub fn discard_pending(&self) {
        self.aggregator().flush();
    }

    pub async fn emit(&self, event: DriverEvent) {
        if let DriverEvent::Error(_) = event {
            self.record_error();
        }
        // Receiver gone means the owner is tearing down
        let _ = self.events.send(event).await;
    }

    pub fn emit_blocking(&self, event: DriverEvent) {
        if let DriverEvent::Error(_) = event {
            self.record_error();
        }
        let _ = self.events.blocking_send(event);
    }

    pub fn buffer_size(&self) -> usize {
        self.aggregator().capacity()
    }

    pub fn set_buffer_size(&self, size: usize) {
        self.aggregator().set_capacity(size);
    }

    pub fn stats(&self) -> DriverStats {
        let uptime_ms = self
            .opened_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        DriverStats {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            uptime_ms,
            last_activity_ms: self.last_activity_ms.load(Ordering::Relaxed),
        }
    }
}
