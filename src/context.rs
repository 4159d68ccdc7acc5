// src/context.rs
//
// Process-wide pipeline context: the driver factory, the shared object and
// buffer pools, and the worker pool settings. Built once and handed to every
// connection manager; independent contexts do not share anything.

use std::sync::Arc;

use crate::framing::FrameDetectionConfig;
use crate::io::ble::BleBackend;
use crate::io::DriverFactory;
use crate::pool::PoolManager;
use crate::workers::WorkerPoolConfig;

#[derive(Clone, Default)]
pub struct ContextConfig {
    pub workers: WorkerPoolConfig,
    /// Initial framing for managers built from this context
    pub framing: FrameDetectionConfig,
    /// Bluetooth backend; the platform default when `None`
    pub ble_backend: Option<Arc<dyn BleBackend>>,
}

pub struct Context {
    factory: Arc<DriverFactory>,
    pools: Arc<PoolManager>,
    workers: WorkerPoolConfig,
    framing: FrameDetectionConfig,
}

impl Context {
    pub fn new(config: ContextConfig) -> Self {
        let factory = match config.ble_backend {
            Some(backend) => DriverFactory::with_ble_backend(backend),
            None => DriverFactory::new(),
        };
        Context {
            factory: Arc::new(factory),
            pools: Arc::new(PoolManager::new()),
            workers: config.workers,
            framing: config.framing,
        }
    }

    pub fn factory(&self) -> &Arc<DriverFactory> {
        &self.factory
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn worker_config(&self) -> &WorkerPoolConfig {
        &self.workers
    }

    pub fn frame_config(&self) -> &FrameDetectionConfig {
        &self.framing
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::BusType;

    #[test]
    fn test_contexts_are_independent() {
        let a = Context::default();
        let b = Context::default();
        assert!(!Arc::ptr_eq(a.factory(), b.factory()));
        assert!(!Arc::ptr_eq(a.pools(), b.pools()));

        let _frame = a.pools().frames().acquire().unwrap();
        assert_eq!(a.pools().frames().stats().used, 1);
        assert_eq!(b.pools().frames().stats().used, 0);
    }

    #[test]
    fn test_custom_ble_backend_is_supported() {
        let backend = Arc::new(crate::io::mock::ScriptedBleBackend::new(&["dev-1"]));
        let ctx = Context::new(ContextConfig {
            ble_backend: Some(backend),
            ..Default::default()
        });
        assert!(ctx.factory().is_supported(BusType::BluetoothLe));
    }
}
