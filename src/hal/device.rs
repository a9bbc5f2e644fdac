use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::core::{FlowError, Result};
use crate::engine::timer::TimerScheduler;
use crate::memory::device_memory::ExternalRegion;
use crate::memory::{DeviceMemory, MemoryManager, MemoryUsage};

/// Whether a device shares the address space of the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Host,
    Accelerator,
}

/// A compute target and the memory manager that owns its allocations
#[derive(Debug)]
pub struct Device {
    id: String,
    device_type: String,
    manager: Arc<MemoryManager>,
}

impl Device {
    pub fn new(device_type: impl Into<String>, id: impl Into<String>, manager: Arc<MemoryManager>) -> Self {
        Self {
            id: id.into(),
            device_type: device_type.into(),
            manager,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn kind(&self) -> DeviceKind {
        self.manager.kind()
    }

    pub fn manager(&self) -> &Arc<MemoryManager> {
        &self.manager
    }

    pub fn start_maintenance(&self, timer: &TimerScheduler, interval: Duration) {
        self.manager.start_maintenance(timer, interval);
    }

    pub fn mem_alloc(&self, size: usize, flags: u32) -> Option<DeviceMemory> {
        self.manager.allocate(size, flags)
    }

    /// Wraps memory owned elsewhere; `release` runs once the last handle is gone
    pub fn mem_acquire<T>(
        &self,
        owner: T,
        release: impl FnOnce(T) + Send + Sync + 'static,
    ) -> Result<DeviceMemory>
    where
        T: AsRef<[u8]> + AsMut<[u8]> + Send + Sync + 'static,
    {
        let size = owner.as_ref().len();
        self.manager
            .make_memory_handle(Box::new(ExternalRegion::new(owner, release)), size)
    }

    /// Allocates device memory holding a copy of `host`
    pub fn mem_write(&self, host: &[u8]) -> Result<DeviceMemory> {
        let mut memory = self
            .mem_alloc(host.len(), 0)
            .ok_or_else(|| FlowError::fault(format!("allocation of {} bytes failed", host.len())))?;
        let dest = memory
            .data_mut()
            .ok_or_else(|| FlowError::fault("fresh allocation is not writable"))?;
        self.manager.write(host, dest)?;
        Ok(memory)
    }

    pub fn memory_usage(&self) -> Result<MemoryUsage> {
        self.manager.usage()
    }
}
