// src/pool/mod.rs
//
// Reusable-instance pools for hot-path allocations: decoded frames,
// statistics records and size-bucketed byte buffers.

mod buffer;
mod object;

pub use buffer::{BufferPool, PooledBuffer, COMMON_BUFFER_SIZES};
pub use object::{ObjectPool, Pooled};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::framing::RawFrame;
use crate::io::CommunicationStatistics;

// ============================================================================
// Types
// ============================================================================

/// A type that can be returned to a pool.
///
/// `reset` must restore the zero value so no state leaks between users.
pub trait Poolable: Send + 'static {
    fn reset(&mut self);
}

impl Poolable for Vec<u8> {
    fn reset(&mut self) {
        self.fill(0);
    }
}

/// Sizing policy for a pool
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Items created up front
    pub initial_size: usize,
    /// Maximum number of items handed out at once
    pub max_size: usize,
    /// Multiplier applied to the pool size when a miss forces growth
    pub growth_factor: f64,
    /// Utilization below which released items are destroyed
    pub shrink_threshold: f64,
}

impl PoolConfig {
    pub const fn new(
        initial_size: usize,
        max_size: usize,
        growth_factor: f64,
        shrink_threshold: f64,
    ) -> Self {
        PoolConfig {
            initial_size,
            max_size,
            growth_factor,
            shrink_threshold,
        }
    }
}

/// Pool for decoded frames
pub const RAW_FRAME_POOL: PoolConfig = PoolConfig::new(30, 300, 1.4, 0.3);
/// Pool for per-connection statistics records
pub const STATISTICS_POOL: PoolConfig = PoolConfig::new(5, 50, 1.2, 0.5);
/// Per-bucket policy for the byte buffer pool
pub const BUFFER_BUCKET_POOL: PoolConfig = PoolConfig::new(10, 100, 1.5, 0.3);

/// Pool failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("object pool '{pool}' exhausted ({max_size} items in use)")]
    Exhausted { pool: String, max_size: usize },
}

/// Point-in-time pool counters. `used + free == size` always holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub used: usize,
    pub free: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

// ============================================================================
// Pool manager
// ============================================================================

/// The pools shared by one pipeline context.
pub struct PoolManager {
    frames: ObjectPool<RawFrame>,
    statistics: ObjectPool<CommunicationStatistics>,
    buffers: BufferPool,
}

/// Snapshot of every pool owned by a [`PoolManager`]
#[derive(Debug, Clone, Serialize)]
pub struct PoolManagerStats {
    pub frames: PoolStats,
    pub statistics: PoolStats,
    pub buffers: BTreeMap<usize, PoolStats>,
}

impl PoolManager {
    pub fn new() -> Self {
        PoolManager {
            frames: ObjectPool::new("raw_frames", RAW_FRAME_POOL, RawFrame::default),
            statistics: ObjectPool::new(
                "statistics",
                STATISTICS_POOL,
                CommunicationStatistics::default,
            ),
            buffers: BufferPool::new(BUFFER_BUCKET_POOL),
        }
    }

    pub fn frames(&self) -> &ObjectPool<RawFrame> {
        &self.frames
    }

    pub fn statistics(&self) -> &ObjectPool<CommunicationStatistics> {
        &self.statistics
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    pub fn stats(&self) -> PoolManagerStats {
        PoolManagerStats {
            frames: self.frames.stats(),
            statistics: self.statistics.stats(),
            buffers: self.buffers.stats(),
        }
    }
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new()
    }
}
