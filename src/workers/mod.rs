// src/workers/mod.rs
//
// Parallel frame extraction.
//
// A fixed-size pool of OS threads, each owning its own `FrameExtractor`.
// Requests carry a unique id and are answered over a per-worker channel;
// a router task per worker matches responses to pending callers, enforces
// timeouts, and replaces a worker that panics or exits.

mod pool;
mod processor;

pub use pool::WorkerPool;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::framing::{ExtractorStats, FrameDetectionConfig, RawFrame};

/// Default request timeout
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;

/// Data requests a worker holds at once. A request that finds no idle
/// worker fails fast with [`WorkerError::Busy`] instead of queueing.
pub const WORKER_QUEUE_DEPTH: usize = 1;

// ============================================================================
// Messages
// ============================================================================

/// Work sent to a worker thread
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    Configure(FrameDetectionConfig),
    ProcessData(Vec<u8>),
    /// Extract from this chunk alone, leaving the worker's buffer untouched.
    /// The caller keeps whatever was not consumed.
    ExtractChunk(Vec<u8>),
    Reset,
    GetStats,
    /// Block the worker thread for a while
    #[cfg(test)]
    Stall(Duration),
    /// Panic inside the worker thread
    #[cfg(test)]
    Panic,
}

#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub id: String,
    pub command: WorkerCommand,
}

/// Worker answer to one request
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReply {
    Configured,
    FrameProcessed {
        frames: Vec<RawFrame>,
        /// Candidates dropped on checksum while processing this chunk
        checksum_errors: u64,
    },
    ChunkExtracted {
        frames: Vec<RawFrame>,
        /// Leading bytes of the chunk that ended up in frames or were dropped
        consumed: usize,
        checksum_errors: u64,
    },
    Reset,
    Stats(ExtractorStats),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct WorkerResponse {
    pub id: String,
    pub reply: WorkerReply,
}

/// Frames extracted from one chunk by a worker
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessedChunk {
    pub frames: Vec<RawFrame>,
    pub checksum_errors: u64,
}

/// Result of a self-contained chunk extraction. Frames are unnumbered
/// (`sequence` 0); `chunk[consumed..]` is the partial tail left to the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedChunk {
    pub frames: Vec<RawFrame>,
    pub consumed: usize,
    pub checksum_errors: u64,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// The pool was torn down while the request was pending
    #[error("worker pool destroyed")]
    Destroyed,

    #[error("request {request_id} timed out after {}ms", after.as_millis())]
    Timeout { request_id: String, after: Duration },

    #[error("processing failed: {0}")]
    Processing(String),

    #[error("worker {worker} failed: {message}")]
    WorkerFailed { worker: usize, message: String },

    #[error("worker {worker} is busy")]
    Busy { worker: usize },

    #[error("no workers available")]
    NoWorkers,
}

impl WorkerError {
    pub fn is_destroyed(&self) -> bool {
        matches!(self, WorkerError::Destroyed)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, WorkerError::Timeout { .. })
    }
}

// ============================================================================
// State, configuration and statistics
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Pool size; `None` sizes the pool from the host's parallelism
    pub max_workers: Option<usize>,
    pub request_timeout_ms: u64,
    /// Whether the connection manager extracts frames on the pool
    pub threaded_extraction: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig {
            max_workers: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            threaded_extraction: true,
        }
    }
}

impl WorkerPoolConfig {
    pub fn worker_count(&self) -> usize {
        match self.max_workers {
            Some(n) => n.max(1),
            None => default_worker_count(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// One less than the host's parallelism, between 2 and 8
pub fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    cpus.saturating_sub(1).clamp(2, 8)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerInfo {
    pub id: usize,
    pub state: WorkerState,
    pub pending_requests: usize,
    pub completed_requests: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerPoolStats {
    pub total_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub error_workers: usize,
    pub pending_requests: usize,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub timeouts: u64,
    pub respawns: u64,
    pub average_response_ms: f64,
    pub workers: Vec<WorkerInfo>,
}

/// Pool lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    PoolInitialized { workers: usize },
    WorkerError { worker: usize, message: String },
    ProcessingError { request_id: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_worker_count_is_clamped() {
        let n = default_worker_count();
        assert!((2..=8).contains(&n));
    }

    #[test]
    fn test_worker_count_override() {
        let cfg = WorkerPoolConfig {
            max_workers: Some(0),
            ..Default::default()
        };
        assert_eq!(cfg.worker_count(), 1);
        let cfg = WorkerPoolConfig {
            max_workers: Some(3),
            ..Default::default()
        };
        assert_eq!(cfg.worker_count(), 3);
    }

    #[test]
    fn test_error_kinds() {
        assert!(WorkerError::Destroyed.is_destroyed());
        let timeout = WorkerError::Timeout {
            request_id: "req_1".to_string(),
            after: Duration::from_millis(250),
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_destroyed());
        assert_eq!(timeout.to_string(), "request req_1 timed out after 250ms");
    }

    #[test]
    fn test_config_from_toml() {
        let cfg: WorkerPoolConfig = toml::from_str("max_workers = 4").unwrap();
        assert_eq!(cfg.max_workers, Some(4));
        assert_eq!(cfg.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
        assert!(cfg.threaded_extraction);
    }
}
