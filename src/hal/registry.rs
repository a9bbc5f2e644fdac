use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Arc;

use super::{CpuBackend, Device, MockAccelerator};
use crate::memory::{MemoryBackend, MemoryManager, PoolConfig};

type BackendFactory = Box<dyn Fn() -> Arc<dyn MemoryBackend> + Send + Sync>;

/// Registry of available device types
pub struct DeviceRegistry {
    factories: HashMap<String, BackendFactory>,
    pool_config: PoolConfig,
}

impl DeviceRegistry {
    pub fn new(pool_config: PoolConfig) -> Self {
        Self {
            factories: HashMap::new(),
            pool_config,
        }
    }

    /// Registry with the `cpu` and `mock` device types
    pub fn with_defaults(pool_config: PoolConfig) -> Self {
        let mut registry = Self::new(pool_config);
        registry.register("cpu", || Arc::new(CpuBackend::new()));
        registry.register("mock", || Arc::new(MockAccelerator::new()));
        registry
    }

    pub fn register<F>(&mut self, device_type: &str, factory: F)
    where
        F: Fn() -> Arc<dyn MemoryBackend> + Send + Sync + 'static,
    {
        self.factories.insert(device_type.to_string(), Box::new(factory));
    }

    pub fn create_device(&self, device_type: &str, id: &str) -> Result<Arc<Device>> {
        let factory = self
            .factories
            .get(device_type)
            .ok_or_else(|| anyhow!("Unknown device type: {}", device_type))?;
        let manager = MemoryManager::new(format!("{device_type}:{id}"), factory(), &self.pool_config);
        Ok(Arc::new(Device::new(device_type, id, manager)))
    }

    pub fn list_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::with_defaults(PoolConfig::default())
    }
}
