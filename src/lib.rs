pub mod buffers;
pub mod core;
pub mod engine;
pub mod flowunits;
pub mod hal;
pub mod logging;
pub mod memory;
pub mod observability;
pub mod registry;
pub mod resilience;

pub use crate::core::{FlowError, Result, StatusCode};
