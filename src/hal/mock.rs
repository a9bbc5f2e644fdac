use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::cpu::{checked_copy, host_alloc};
use crate::core::{FlowError, Result};
use crate::hal::DeviceKind;
use crate::memory::{CopyKind, MemoryBackend, MemoryUsage};

/// Simulated accelerator backed by host memory
///
/// Records the routing of every copy and can be limited in capacity or
/// told to fail copies, which makes the copy and allocation paths testable
/// without real hardware.
#[derive(Debug, Default)]
pub struct MockAccelerator {
    capacity: Option<usize>,
    allocated: AtomicUsize,
    copies: Mutex<Vec<CopyKind>>,
    fail_copies: AtomicBool,
}

impl MockAccelerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    pub fn set_fail_copies(&self, fail: bool) {
        self.fail_copies.store(fail, Ordering::SeqCst);
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn copy_log(&self) -> Vec<CopyKind> {
        self.copies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl MemoryBackend for MockAccelerator {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Accelerator
    }

    fn mem_alloc(&self, size: usize) -> Option<Box<[u8]>> {
        let reserved = self
            .allocated
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                let next = current.checked_add(size)?;
                match self.capacity {
                    Some(capacity) if next > capacity => None,
                    _ => Some(next),
                }
            });
        if reserved.is_err() {
            return None;
        }

        let region = host_alloc(size);
        if region.is_none() {
            self.allocated.fetch_sub(size, Ordering::SeqCst);
        }
        region
    }

    fn mem_free(&self, region: Box<[u8]>) {
        self.allocated.fetch_sub(region.len(), Ordering::SeqCst);
    }

    fn copy(&self, dest: &mut [u8], src: &[u8], kind: CopyKind) -> Result<()> {
        if self.fail_copies.load(Ordering::SeqCst) {
            return Err(FlowError::fault(format!("simulated {kind:?} copy failure")));
        }
        self.copies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(kind);
        checked_copy(dest, src)
    }

    fn usage(&self) -> Result<MemoryUsage> {
        let total = self.capacity.unwrap_or(usize::MAX) as u64;
        Ok(MemoryUsage {
            free: total.saturating_sub(self.allocated() as u64),
            total,
        })
    }
}
