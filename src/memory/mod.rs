pub mod device_memory;
pub mod manager;
pub mod pool;

pub use device_memory::{DeviceMemory, MemoryRegion};
pub use manager::{CopyKind, MemoryBackend, MemoryManager, MemoryUsage, GUARD_SIZE, MEM_MAGIC_CODE};
pub use pool::{PoolConfig, PooledRegion, SlabPool};
