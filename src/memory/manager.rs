use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};

use super::device_memory::{DeviceMemory, MemoryRegion};
use super::pool::{PoolConfig, SlabPool};
use crate::core::{FlowError, Result};
use crate::engine::timer::{TimerScheduler, TimerTask};
use crate::hal::DeviceKind;

/// Guard value written right after the logical payload of every pooled allocation
pub const MEM_MAGIC_CODE: u64 = 0x0123_4567_89ab_cdef;
pub const GUARD_SIZE: usize = std::mem::size_of::<u64>();

/// Selects which side's copy primitive performs a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopyKind {
    ToHost,
    ToDevice,
    DeviceToDevice,
    Default,
}

impl CopyKind {
    pub fn between(dest: DeviceKind, src: DeviceKind) -> Self {
        match (dest, src) {
            (DeviceKind::Host, DeviceKind::Host) => CopyKind::Default,
            (DeviceKind::Host, DeviceKind::Accelerator) => CopyKind::ToHost,
            (DeviceKind::Accelerator, DeviceKind::Host) => CopyKind::ToDevice,
            (DeviceKind::Accelerator, DeviceKind::Accelerator) => CopyKind::DeviceToDevice,
        }
    }
}

/// Free/total bytes reported by a device, informational only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub free: u64,
    pub total: u64,
}

/// Physical memory primitives of one device kind
pub trait MemoryBackend: Send + Sync {
    fn kind(&self) -> DeviceKind;

    /// Returns `None` on allocation failure, never panics
    fn mem_alloc(&self, size: usize) -> Option<Box<[u8]>>;

    fn mem_free(&self, region: Box<[u8]>) {
        drop(region);
    }

    /// Native copy primitive; `dest` and `src` always have equal length
    fn copy(&self, dest: &mut [u8], src: &[u8], kind: CopyKind) -> Result<()>;

    fn usage(&self) -> Result<MemoryUsage>;
}

/// Allocation and copy authority for a single device
pub struct MemoryManager {
    device_id: String,
    backend: Arc<dyn MemoryBackend>,
    pool: SlabPool,
    maintenance: Mutex<Option<TimerTask>>,
}

impl MemoryManager {
    pub fn new(
        device_id: impl Into<String>,
        backend: Arc<dyn MemoryBackend>,
        config: &PoolConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            device_id: device_id.into(),
            pool: SlabPool::new(backend.clone(), config),
            backend,
            maintenance: Mutex::new(None),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn kind(&self) -> DeviceKind {
        self.backend.kind()
    }

    pub fn pool(&self) -> &SlabPool {
        &self.pool
    }

    /// Schedules periodic pool maintenance on `timer`
    pub fn start_maintenance(self: &Arc<Self>, timer: &TimerScheduler, interval: Duration) {
        if interval.is_zero() {
            return;
        }

        let manager = Arc::downgrade(self);
        let task = TimerTask::new(format!("{}-pool-maintain", self.device_id), move || {
            if let Some(manager) = manager.upgrade() {
                manager.maintain();
            }
        });
        timer.schedule(&task, interval, interval);

        let previous = self.maintenance
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    pub fn maintain(&self) -> usize {
        self.pool.maintain()
    }

    /// Wraps an already allocated region, no allocation happens here
    pub fn make_memory_handle(
        self: &Arc<Self>,
        region: Box<dyn MemoryRegion>,
        size: usize,
    ) -> Result<DeviceMemory> {
        if region.bytes().len() < size {
            return Err(FlowError::invalid(format!(
                "region of {} bytes cannot hold {} bytes",
                region.bytes().len(),
                size
            )));
        }
        Ok(DeviceMemory::new(self, region, size, None))
    }

    /// Allocates `size` bytes followed by the guard value
    pub fn allocate(self: &Arc<Self>, size: usize, flags: u32) -> Option<DeviceMemory> {
        let Some(total) = size.checked_add(GUARD_SIZE) else {
            error!(size, "allocation size overflow");
            return None;
        };

        let Some(mut region) = self.pool.allocate(total) else {
            warn!(device = %self.device_id, size, flags, "device memory allocation failed");
            return None;
        };
        region.as_mut_slice()[size..total].copy_from_slice(&MEM_MAGIC_CODE.to_ne_bytes());

        Some(DeviceMemory::new(self, Box::new(region), size, Some(size)))
    }

    /// Allocation outside of the pool, released only through `raw_free`
    pub fn raw_allocate(&self, size: usize, flags: u32) -> Option<Box<[u8]>> {
        let region = self.backend.mem_alloc(size);
        if region.is_none() {
            warn!(device = %self.device_id, size, flags, "raw allocation failed");
        }
        region
    }

    pub fn raw_free(&self, region: Box<[u8]>, _flags: u32) {
        self.backend.mem_free(region);
    }

    /// Copies device bytes into a host buffer at least as large
    pub fn read(&self, device_src: &[u8], host_dst: &mut [u8]) -> Result<()> {
        if device_src.len() > host_dst.len() {
            error!(
                src_size = device_src.len(),
                dest_size = host_dst.len(),
                "read size mismatch"
            );
            return Err(FlowError::invalid("host buffer smaller than device data"));
        }

        let len = device_src.len();
        self.backend.copy(&mut host_dst[..len], device_src, CopyKind::ToHost)
    }

    /// Copies host bytes into a device buffer at least as large
    pub fn write(&self, host_src: &[u8], device_dst: &mut [u8]) -> Result<()> {
        if host_src.len() > device_dst.len() {
            error!(
                src_size = host_src.len(),
                dest_size = device_dst.len(),
                "write size mismatch"
            );
            return Err(FlowError::invalid("device buffer smaller than host data"));
        }

        let len = host_src.len();
        self.backend.copy(&mut device_dst[..len], host_src, CopyKind::ToDevice)
    }

    /// Bounds-checked copy between two handles using this manager's primitive
    pub fn copy_between(
        &self,
        dest: &mut DeviceMemory,
        dest_offset: usize,
        src: &DeviceMemory,
        src_offset: usize,
        size: usize,
        kind: CopyKind,
    ) -> Result<()> {
        let dest_end = dest_offset.checked_add(size).filter(|end| *end <= dest.capacity());
        let src_end = src_offset.checked_add(size).filter(|end| *end <= src.capacity());
        let (Some(dest_end), Some(src_end)) = (dest_end, src_end) else {
            error!(
                dest_offset,
                dest_capacity = dest.capacity(),
                src_offset,
                src_capacity = src.capacity(),
                size,
                "copy out of bounds"
            );
            return Err(FlowError::invalid("copy range exceeds memory capacity"));
        };

        let src_bytes = &src.data()[src_offset..src_end];
        let Some(dest_bytes) = dest.data_mut() else {
            return Err(FlowError::fault("destination memory is not writable"));
        };

        debug!(device = %self.device_id, ?kind, size, "device memory copy");
        self.backend.copy(&mut dest_bytes[dest_offset..dest_end], src_bytes, kind)
    }

    pub fn usage(&self) -> Result<MemoryUsage> {
        self.backend.usage()
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("device_id", &self.device_id)
            .field("kind", &self.kind())
            .field("live_regions", &self.pool.live_regions())
            .field("cached_bytes", &self.pool.cached_bytes())
            .finish()
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        let task = self.maintenance
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.stop();
        }
        self.pool.drain();
    }
}
