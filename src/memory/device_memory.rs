use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::error;

use super::manager::{CopyKind, MemoryManager, GUARD_SIZE, MEM_MAGIC_CODE};
use super::pool::PooledRegion;
use crate::core::{FlowError, Result};
use crate::hal::DeviceKind;

/// Backing storage of a `DeviceMemory` handle
pub trait MemoryRegion: Send + Sync {
    fn bytes(&self) -> &[u8];
    fn bytes_mut(&mut self) -> &mut [u8];
}

impl MemoryRegion for PooledRegion {
    fn bytes(&self) -> &[u8] {
        self.as_slice()
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

type ReleaseFn<T> = Box<dyn FnOnce(T) + Send + Sync>;

/// Externally owned memory; `release` receives the owner exactly once on drop
pub struct ExternalRegion<T>
where
    T: AsRef<[u8]> + AsMut<[u8]> + Send + Sync + 'static,
{
    owner: Option<T>,
    release: Option<ReleaseFn<T>>,
}

impl<T> ExternalRegion<T>
where
    T: AsRef<[u8]> + AsMut<[u8]> + Send + Sync + 'static,
{
    pub fn new(owner: T, release: impl FnOnce(T) + Send + Sync + 'static) -> Self {
        Self {
            owner: Some(owner),
            release: Some(Box::new(release)),
        }
    }
}

impl<T> MemoryRegion for ExternalRegion<T>
where
    T: AsRef<[u8]> + AsMut<[u8]> + Send + Sync + 'static,
{
    fn bytes(&self) -> &[u8] {
        self.owner.as_ref().map(|o| o.as_ref()).unwrap_or(&[])
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.owner.as_mut().map(|o| o.as_mut()).unwrap_or(&mut [])
    }
}

impl<T> Drop for ExternalRegion<T>
where
    T: AsRef<[u8]> + AsMut<[u8]> + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let (Some(owner), Some(release)) = (self.owner.take(), self.release.take()) {
            release(owner);
        }
    }
}

/// Handle to one region on a device
pub struct DeviceMemory {
    device_id: String,
    kind: DeviceKind,
    manager: Weak<MemoryManager>,
    region: Arc<dyn MemoryRegion>,
    offset: usize,
    capacity: usize,
    mutable: AtomicBool,
    /// Absolute position of the guard value inside `region`
    guard_at: Option<usize>,
}

impl DeviceMemory {
    pub(crate) fn new(
        manager: &Arc<MemoryManager>,
        region: Box<dyn MemoryRegion>,
        capacity: usize,
        guard_at: Option<usize>,
    ) -> Self {
        Self {
            device_id: manager.device_id().to_string(),
            kind: manager.kind(),
            manager: Arc::downgrade(manager),
            region: Arc::from(region),
            offset: 0,
            capacity,
            mutable: AtomicBool::new(true),
            guard_at,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn is_host(&self) -> bool {
        self.kind == DeviceKind::Host
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> usize {
        self.capacity
    }

    /// Owning manager, `None` once it has been dropped
    pub fn manager(&self) -> Option<Arc<MemoryManager>> {
        self.manager.upgrade()
    }

    pub fn is_content_mutable(&self) -> bool {
        self.mutable.load(Ordering::Acquire)
    }

    pub fn set_content_mutable(&self, mutable: bool) {
        self.mutable.store(mutable, Ordering::Release);
    }

    pub fn data(&self) -> &[u8] {
        &self.region.bytes()[self.offset..self.offset + self.capacity]
    }

    /// Writable view; `None` when frozen or when the region is shared with another handle
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        if !self.is_content_mutable() {
            return None;
        }
        let (offset, capacity) = (self.offset, self.capacity);
        Arc::get_mut(&mut self.region).map(|region| &mut region.bytes_mut()[offset..offset + capacity])
    }

    pub fn same_region(&self, other: &DeviceMemory) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.region), Arc::as_ptr(&other.region))
    }

    /// Checks the guard value behind the payload
    pub fn verify(&self) -> Result<()> {
        let Some(guard_at) = self.guard_at else {
            return Ok(());
        };

        let guard = self.region
            .bytes()
            .get(guard_at..guard_at + GUARD_SIZE)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u64::from_ne_bytes);

        match guard {
            Some(MEM_MAGIC_CODE) => Ok(()),
            other => {
                error!(
                    device = %self.device_id,
                    offset = self.offset,
                    capacity = self.capacity,
                    guard = ?other,
                    "memory guard corrupted"
                );
                Err(FlowError::fault("device memory guard value corrupted"))
            }
        }
    }

    /// Copies `src_size` bytes of `src` into this handle through the source's manager
    pub fn read_from(
        &mut self,
        src: &DeviceMemory,
        src_offset: usize,
        src_size: usize,
        dest_offset: usize,
    ) -> Result<()> {
        let src_ok = src_offset
            .checked_add(src_size)
            .is_some_and(|end| end <= src.capacity);
        let dest_ok = dest_offset
            .checked_add(src_size)
            .is_some_and(|end| end <= self.capacity);
        if !src_ok || !dest_ok {
            error!(
                src_offset,
                src_size,
                src_capacity = src.capacity,
                dest_offset,
                dest_capacity = self.capacity,
                "read_from out of bounds"
            );
            return Err(FlowError::invalid("read_from range exceeds memory capacity"));
        }

        let Some(manager) = src.manager() else {
            return Err(FlowError::fault(format!(
                "memory manager of device {} is gone",
                src.device_id
            )));
        };

        let kind = CopyKind::between(self.kind, src.kind);
        manager.copy_between(self, dest_offset, src, src_offset, src_size, kind)
    }

    /// Read-only view over `size` bytes starting at `offset`
    pub fn cut(&self, offset: usize, size: usize) -> Result<DeviceMemory> {
        if !offset.checked_add(size).is_some_and(|end| end <= self.capacity) {
            return Err(FlowError::invalid(format!(
                "cut [{offset}, +{size}) exceeds capacity {}",
                self.capacity
            )));
        }

        Ok(DeviceMemory {
            device_id: self.device_id.clone(),
            kind: self.kind,
            manager: self.manager.clone(),
            region: self.region.clone(),
            offset: self.offset + offset,
            capacity: size,
            mutable: AtomicBool::new(false),
            guard_at: self.guard_at,
        })
    }

    /// Deep copy into a fresh allocation on the same device
    pub fn clone_memory(&self, mutable: bool) -> Result<DeviceMemory> {
        let manager = self
            .manager()
            .ok_or_else(|| FlowError::fault("memory manager is gone"))?;
        let mut copy = manager
            .allocate(self.capacity, 0)
            .ok_or_else(|| FlowError::fault("clone allocation failed"))?;
        copy.read_from(self, 0, self.capacity, 0)?;
        copy.set_content_mutable(mutable);
        Ok(copy)
    }
}

impl fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("device_id", &self.device_id)
            .field("kind", &self.kind)
            .field("offset", &self.offset)
            .field("capacity", &self.capacity)
            .field("mutable", &self.is_content_mutable())
            .finish()
    }
}
