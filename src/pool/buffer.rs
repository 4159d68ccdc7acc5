// src/pool/buffer.rs
//
// Byte buffer pool with power-of-two size buckets. A request is served
// from the smallest bucket that fits; the caller sees only the requested
// length while the full buffer goes back to its bucket on release.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use super::{ObjectPool, PoolConfig, PoolError, PoolStats, Pooled};

/// Buckets created up front
pub const COMMON_BUFFER_SIZES: [usize; 6] = [64, 256, 1024, 4096, 16384, 65536];

/// Size-bucketed pool of zeroed byte buffers.
pub struct BufferPool {
    config: PoolConfig,
    buckets: Mutex<BTreeMap<usize, ObjectPool<Vec<u8>>>>,
}

impl BufferPool {
    pub fn new(config: PoolConfig) -> Self {
        let buckets = COMMON_BUFFER_SIZES
            .iter()
            .map(|&size| (size, Self::bucket(size, config)))
            .collect();
        BufferPool {
            config,
            buckets: Mutex::new(buckets),
        }
    }

    fn bucket(size: usize, config: PoolConfig) -> ObjectPool<Vec<u8>> {
        ObjectPool::new(&format!("buffer_{}", size), config, move || vec![0u8; size])
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<usize, ObjectPool<Vec<u8>>>> {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Borrow a zeroed buffer of exactly `len` visible bytes.
    pub fn acquire(&self, len: usize) -> Result<PooledBuffer, PoolError> {
        let pool = {
            let mut buckets = self.lock();
            match buckets.range(len..).next() {
                Some((_, pool)) => pool.clone(),
                None => {
                    // Oversized request: open a bucket at the next power of two,
                    // without pre-allocating
                    let size = len.next_power_of_two();
                    debug!("[pool] creating buffer bucket of {} bytes", size);
                    let config = PoolConfig {
                        initial_size: 0,
                        ..self.config
                    };
                    buckets
                        .entry(size)
                        .or_insert_with(|| Self::bucket(size, config))
                        .clone()
                }
            }
        };

        Ok(PooledBuffer {
            inner: pool.acquire()?,
            len,
        })
    }

    /// Hand a buffer back. Buffers whose size has no bucket are logged and
    /// discarded.
    pub fn release(&self, buffer: PooledBuffer) -> bool {
        let capacity = buffer.capacity();
        let pool = self.lock().get(&capacity).cloned();
        match pool {
            Some(pool) => pool.release(buffer.inner),
            None => {
                warn!("[pool] no buffer bucket for size {}, discarding", capacity);
                false
            }
        }
    }

    /// Bucket sizes currently open
    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.lock().keys().copied().collect()
    }

    pub fn stats(&self) -> BTreeMap<usize, PoolStats> {
        self.lock()
            .iter()
            .map(|(&size, pool)| (size, pool.stats()))
            .collect()
    }
}

/// A buffer on loan from a [`BufferPool`].
///
/// Dereferences to the requested length; the rest of the bucket-sized
/// buffer stays hidden and is restored on release.
pub struct PooledBuffer {
    inner: Pooled<Vec<u8>>,
    len: usize,
}

impl PooledBuffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the underlying bucket buffer
    pub fn capacity(&self) -> usize {
        self.inner.len()
    }

    /// Whether the caller sees only part of the underlying buffer
    pub fn is_sub_slice(&self) -> bool {
        self.len < self.inner.len()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.inner[..self.len]
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.inner[..len]
    }
}
