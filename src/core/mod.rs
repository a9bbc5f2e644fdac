pub mod config;
pub mod context;
pub mod defer;
pub mod flowunit;
pub mod status;

pub use config::{Configuration, RuntimeConfig};
pub use context::{DataContext, FlowUnitEvent, WeakContext};
pub use defer::DeferCond;
pub use flowunit::{FlowType, FlowUnit};
pub use status::{FlowError, Result, StatusCode};
