use std::any::Any;
use std::ops::Index;
use std::sync::Arc;

use super::buffer::Buffer;
use crate::core::{FlowError, Result};
use crate::hal::Device;

/// Ordered batch of buffers produced by one invocation
#[derive(Debug, Clone, Default)]
pub struct BufferList {
    device: Option<Arc<Device>>,
    buffers: Vec<Buffer>,
}

impl BufferList {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device: Some(device),
            buffers: Vec::new(),
        }
    }

    pub fn device(&self) -> Option<&Arc<Device>> {
        self.device.as_ref()
    }

    fn require_device(&self) -> Result<Arc<Device>> {
        self.device
            .clone()
            .ok_or_else(|| FlowError::fault("buffer list has no device"))
    }

    /// Allocates one buffer per size; on failure the list is left unchanged
    pub fn build(&mut self, sizes: &[usize]) -> Result<()> {
        let device = self.require_device()?;
        let batch = sizes
            .iter()
            .map(|&size| {
                let mut buffer = Buffer::new(device.clone());
                buffer.build(size).map(|_| buffer)
            })
            .collect::<Result<Vec<_>>>()?;

        self.buffers = batch;
        Ok(())
    }

    /// Splits `bytes` by `sizes` into freshly built buffers
    pub fn build_from_host(&mut self, sizes: &[usize], bytes: &[u8]) -> Result<()> {
        let total: usize = sizes.iter().sum();
        if total != bytes.len() {
            return Err(FlowError::invalid(format!(
                "sizes add up to {total} bytes but {} were given",
                bytes.len()
            )));
        }

        let device = self.require_device()?;
        let mut offset = 0;
        let batch = sizes
            .iter()
            .map(|&size| {
                let mut buffer = Buffer::new(device.clone());
                let chunk = &bytes[offset..offset + size];
                offset += size;
                buffer.build_from_host(chunk).map(|_| buffer)
            })
            .collect::<Result<Vec<_>>>()?;

        self.buffers = batch;
        Ok(())
    }

    pub fn push_back(&mut self, buffer: Buffer) {
        self.buffers.push(buffer);
    }

    pub fn at(&self, index: usize) -> Option<&Buffer> {
        self.buffers.get(index)
    }

    pub fn at_mut(&mut self, index: usize) -> Option<&mut Buffer> {
        self.buffers.get_mut(index)
    }

    pub fn const_buffer_data(&self, index: usize) -> Option<&[u8]> {
        self.buffers.get(index)?.data()
    }

    pub fn mutable_buffer_data(&mut self, index: usize) -> Option<&mut [u8]> {
        self.buffers.get_mut(index)?.mutable_data()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Buffer> {
        self.buffers.iter()
    }

    /// Total payload bytes over all buffers
    pub fn bytes(&self) -> usize {
        self.buffers.iter().map(Buffer::bytes).sum()
    }

    pub fn set_meta<T: Any + Send + Sync + Clone>(&mut self, key: &str, value: T) {
        for buffer in &mut self.buffers {
            buffer.set(key, value.clone());
        }
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    pub fn into_vec(self) -> Vec<Buffer> {
        self.buffers
    }
}

impl Index<usize> for BufferList {
    type Output = Buffer;

    fn index(&self, index: usize) -> &Buffer {
        &self.buffers[index]
    }
}

impl<'a> IntoIterator for &'a BufferList {
    type Item = &'a Buffer;
    type IntoIter = std::slice::Iter<'a, Buffer>;

    fn into_iter(self) -> Self::IntoIter {
        self.buffers.iter()
    }
}
