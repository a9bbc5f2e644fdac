pub mod buffer;
pub mod list;
pub mod meta;

pub use buffer::{Buffer, BufferType};
pub use list::BufferList;
pub use meta::{BufferMeta, DataMeta, MetaMap, MetaValue};
