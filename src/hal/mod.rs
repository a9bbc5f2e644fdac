pub mod cpu;
pub mod device;
pub mod mock;
pub mod registry;

pub use cpu::CpuBackend;
pub use device::{Device, DeviceKind};
pub use mock::MockAccelerator;
pub use registry::DeviceRegistry;
