use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use tracing::warn;

use super::meta::BufferMeta;
use crate::core::{FlowError, Result};
use crate::hal::Device;
use crate::memory::{CopyKind, DeviceMemory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferType {
    #[default]
    Raw,
    Image,
    String,
}

/// One item of pipeline data
///
/// `Clone` is the shallow copy: the device memory is shared, the metadata is
/// copied.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    meta: BufferMeta,
    device: Option<Arc<Device>>,
    memory: Option<Arc<DeviceMemory>>,
    buffer_type: BufferType,
}

impl Buffer {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device: Some(device),
            ..Self::default()
        }
    }

    pub fn device(&self) -> Option<&Arc<Device>> {
        self.device.as_ref()
    }

    fn require_device(&self) -> Result<&Arc<Device>> {
        self.device
            .as_ref()
            .ok_or_else(|| FlowError::fault("buffer has no device"))
    }

    /// Allocates `size` bytes on the buffer's device
    pub fn build(&mut self, size: usize) -> Result<()> {
        let device = self.require_device()?;
        let Some(memory) = device.mem_alloc(size, 0) else {
            warn!(device = device.id(), size, "buffer build failed");
            return Err(FlowError::fault(format!("allocating {size} bytes failed")));
        };
        self.memory = Some(Arc::new(memory));
        Ok(())
    }

    /// Takes ownership of externally owned bytes; `release` runs when the last
    /// reference to the memory is dropped
    pub fn build_from_owned<T>(
        &mut self,
        owner: T,
        release: impl FnOnce(T) + Send + Sync + 'static,
    ) -> Result<()>
    where
        T: AsRef<[u8]> + AsMut<[u8]> + Send + Sync + 'static,
    {
        let memory = self.require_device()?.mem_acquire(owner, release)?;
        self.memory = Some(Arc::new(memory));
        Ok(())
    }

    pub fn build_from_host(&mut self, bytes: &[u8]) -> Result<()> {
        let memory = self.require_device()?.mem_write(bytes)?;
        self.memory = Some(Arc::new(memory));
        Ok(())
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.memory.as_deref().map(DeviceMemory::data)
    }

    /// `None` when frozen or when the memory is shared with another buffer
    pub fn mutable_data(&mut self) -> Option<&mut [u8]> {
        Arc::get_mut(self.memory.as_mut()?)?.data_mut()
    }

    pub fn bytes(&self) -> usize {
        self.memory.as_ref().map_or(0, |m| m.size())
    }

    pub fn is_empty(&self) -> bool {
        self.bytes() == 0
    }

    pub fn set_mutable(&self, mutable: bool) {
        if let Some(memory) = &self.memory {
            memory.set_content_mutable(mutable);
        }
    }

    pub fn is_mutable(&self) -> bool {
        self.memory.as_ref().is_some_and(|m| m.is_content_mutable())
    }

    pub fn device_memory(&self) -> Option<&Arc<DeviceMemory>> {
        self.memory.as_ref()
    }

    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    pub fn set_buffer_type(&mut self, buffer_type: BufferType) {
        self.buffer_type = buffer_type;
    }

    /// Marks the item as failed; the payload is released
    pub fn set_error(&mut self, error: FlowError) {
        self.meta.set_error(error);
        self.memory = None;
    }

    pub fn has_error(&self) -> bool {
        self.meta.error().is_some()
    }

    pub fn error(&self) -> Option<&FlowError> {
        self.meta.error()
    }

    pub fn meta(&self) -> &BufferMeta {
        &self.meta
    }

    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.meta.set(key, value);
    }

    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.meta.get(key)
    }

    pub fn get_or<T: Any + Clone>(&self, key: &str, default: T) -> T {
        self.meta.get_or(key, default)
    }

    pub fn copy_meta(&mut self, other: &Buffer, overwrite: bool) {
        self.meta.copy_meta(&other.meta, overwrite);
    }

    pub fn copy(&self) -> Buffer {
        self.clone()
    }

    /// Copies bytes and metadata into new memory on the same device
    pub fn deep_copy(&self) -> Result<Buffer> {
        let memory = match &self.memory {
            Some(memory) => Some(Arc::new(memory.clone_memory(memory.is_content_mutable())?)),
            None => None,
        };

        Ok(Buffer {
            meta: self.meta.deep_copy(),
            device: self.device.clone(),
            memory,
            buffer_type: self.buffer_type,
        })
    }

    /// Like `deep_copy` but the new memory lives on `target`
    pub fn copy_to(&self, target: &Arc<Device>) -> Result<Buffer> {
        let mut copy = Buffer {
            meta: self.meta.deep_copy(),
            device: Some(target.clone()),
            memory: None,
            buffer_type: self.buffer_type,
        };
        let Some(src) = &self.memory else {
            return Ok(copy);
        };

        let mut dest = target
            .mem_alloc(src.size(), 0)
            .ok_or_else(|| FlowError::fault(format!("allocating {} bytes on {} failed", src.size(), target.id())))?;
        let kind = CopyKind::between(target.kind(), src.kind());
        target
            .manager()
            .copy_between(&mut dest, 0, src, 0, src.size(), kind)?;

        copy.memory = Some(Arc::new(dest));
        Ok(copy)
    }

    pub fn verify(&self) -> Result<()> {
        self.memory.as_ref().map_or(Ok(()), |m| m.verify())
    }
}
