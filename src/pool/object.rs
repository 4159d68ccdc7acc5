// src/pool/object.rs
//
// Generic object pool with hit/miss accounting, growth on demand and
// shrinking under low utilization. Acquired items come back automatically
// when their `Pooled` handle is dropped.

use std::collections::HashSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, warn};

use super::{PoolConfig, PoolError, PoolStats, Poolable};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

struct PoolState<T> {
    free: Vec<T>,
    in_use: HashSet<u64>,
    next_item_id: u64,
    hits: u64,
    misses: u64,
}

struct PoolShared<T> {
    id: u64,
    name: String,
    config: PoolConfig,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    state: Mutex<PoolState<T>>,
}

impl<T: Poolable> PoolShared<T> {
    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return an item released by its handle.
    fn give_back(&self, item_id: u64, mut value: T) {
        let mut state = self.lock();
        if !state.in_use.remove(&item_id) {
            debug!("[pool] {}: dropping untracked item {}", self.name, item_id);
            return;
        }

        value.reset();

        let total = state.free.len() + state.in_use.len();
        let utilization = if total == 0 {
            1.0
        } else {
            state.in_use.len() as f64 / total as f64
        };
        // Low demand: let the item go instead of keeping it, down to the initial size
        if utilization < self.config.shrink_threshold
            && state.free.len() >= self.config.initial_size
        {
            return;
        }
        state.free.push(value);
    }

    /// Forget an item that left the pool for good.
    fn forget(&self, item_id: u64) {
        self.lock().in_use.remove(&item_id);
    }
}

// ============================================================================
// ObjectPool
// ============================================================================

/// A pool of reusable `T`. Cloning the pool clones the handle, not the items.
pub struct ObjectPool<T: Poolable> {
    shared: Arc<PoolShared<T>>,
}

impl<T: Poolable> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        ObjectPool {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Poolable> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("name", &self.shared.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T: Poolable> ObjectPool<T> {
    /// Create a pool and pre-fill it with `config.initial_size` items.
    pub fn new<F>(name: &str, config: PoolConfig, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let initial = config.initial_size.min(config.max_size);
        let free = (0..initial).map(|_| factory()).collect();
        ObjectPool {
            shared: Arc::new(PoolShared {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                name: name.to_string(),
                config,
                factory: Box::new(factory),
                state: Mutex::new(PoolState {
                    free,
                    in_use: HashSet::new(),
                    next_item_id: 1,
                    hits: 0,
                    misses: 0,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> PoolConfig {
        self.shared.config
    }

    /// Take an item from the pool, creating one if the free list is empty.
    ///
    /// Fails with [`PoolError::Exhausted`] once `max_size` items are in use.
    pub fn acquire(&self) -> Result<Pooled<T>, PoolError> {
        let shared = &self.shared;
        let mut state = shared.lock();

        let value = if let Some(value) = state.free.pop() {
            state.hits += 1;
            value
        } else if state.in_use.len() < shared.config.max_size {
            state.misses += 1;
            // Grow the free list so the next few acquisitions are hits
            let total = state.in_use.len() + 1;
            let target = (total as f64 * shared.config.growth_factor).ceil() as usize;
            let extra = target
                .min(shared.config.max_size)
                .saturating_sub(total);
            for _ in 0..extra {
                state.free.push((shared.factory)());
            }
            (shared.factory)()
        } else {
            return Err(PoolError::Exhausted {
                pool: shared.name.clone(),
                max_size: shared.config.max_size,
            });
        };

        let item_id = state.next_item_id;
        state.next_item_id += 1;
        state.in_use.insert(item_id);

        Ok(Pooled {
            value: Some(value),
            slot: Some(Slot {
                pool_id: shared.id,
                item_id,
                pool: Arc::downgrade(shared),
            }),
        })
    }

    /// Hand an item back explicitly.
    ///
    /// Items that this pool did not hand out are logged and ignored; they
    /// still go back to their own pool when dropped. Returns whether the
    /// item was accepted.
    pub fn release(&self, item: Pooled<T>) -> bool {
        let owned = item.slot.as_ref().is_some_and(|slot| {
            slot.pool_id == self.shared.id && self.shared.lock().in_use.contains(&slot.item_id)
        });
        if !owned {
            warn!(
                "[pool] {}: release of an item not tracked as in use, ignored",
                self.shared.name
            );
        }
        drop(item);
        owned
    }

    /// Drop every free item and stop tracking items in use.
    /// Outstanding handles are discarded when they drop.
    pub fn clear(&self) {
        let mut state = self.shared.lock();
        state.free.clear();
        state.in_use.clear();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        let used = state.in_use.len();
        let free = state.free.len();
        let lookups = state.hits + state.misses;
        PoolStats {
            size: used + free,
            used,
            free,
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }
}

// ============================================================================
// Pooled handle
// ============================================================================

struct Slot<T> {
    pool_id: u64,
    item_id: u64,
    pool: Weak<PoolShared<T>>,
}

/// An item on loan from an [`ObjectPool`]. Returned to the pool on drop.
pub struct Pooled<T: Poolable> {
    value: Option<T>,
    slot: Option<Slot<T>>,
}

impl<T: Poolable> Pooled<T> {
    /// Wrap a value that does not belong to any pool.
    pub fn detached(value: T) -> Self {
        Pooled {
            value: Some(value),
            slot: None,
        }
    }

    pub fn is_detached(&self) -> bool {
        self.slot.is_none()
    }

    /// Take the value out of the pool permanently.
    pub fn into_inner(mut self) -> T {
        if let Some(slot) = self.slot.take() {
            if let Some(pool) = slot.pool.upgrade() {
                pool.forget(slot.item_id);
            }
        }
        match self.value.take() {
            Some(value) => value,
            None => unreachable!("pooled value is only taken on drop"),
        }
    }
}

impl<T: Poolable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.value {
            Some(value) => value,
            None => unreachable!("pooled value is only taken on drop"),
        }
    }
}

impl<T: Poolable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("pooled value is only taken on drop"),
        }
    }
}

impl<T: Poolable + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: Poolable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let (Some(value), Some(slot)) = (self.value.take(), self.slot.take()) {
            if let Some(pool) = slot.pool.upgrade() {
                pool.give_back(slot.item_id, value);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
