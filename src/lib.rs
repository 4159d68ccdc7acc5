// src/lib.rs
//
// Byte-stream ingestion pipeline: transport drivers (serial, TCP/UDP, BLE),
// a connection manager with a reconnect-aware state machine, delimiter and
// checksum based frame extraction, a worker pool that runs extraction off
// the async runtime, and the object/buffer pools that keep the hot path
// allocation-free.

pub mod checksums;
pub mod config;
pub mod context;
pub mod framing;
pub mod io;
pub mod logging;
pub mod pool;
pub mod workers;

pub use context::{Context, ContextConfig};
pub use io::{ConnectionManager, ConnectionState, DeviceConfig, IoEvent};
