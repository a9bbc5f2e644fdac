pub mod resize;
pub mod source;

pub use resize::{Interpolation, ResizeFlowUnit};
pub use source::{Packet, PacketSourceFlowUnit, ReaderFactory, StreamInfo, StreamReader};
