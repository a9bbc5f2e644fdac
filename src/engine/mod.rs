pub mod executor;
pub mod state;
pub mod timer;

pub use executor::{OutputBatch, StreamExecutor, StreamOutcome, StreamReport, ERROR_PORT};
pub use state::StreamState;
pub use timer::{TimerScheduler, TimerTask};
