use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Status values exchanged between the core and flow units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    Fault,
    Invalid,
    BadConfig,
    NotSupported,
    /// The flow unit wants to be invoked again for the same stream
    Continue,
    /// A source has no more data
    NoData,
    /// The stream finished without error
    Success,
}

impl StatusCode {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::Fault | Self::Invalid | Self::BadConfig | Self::NotSupported
        )
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Ok => "Ok",
            Self::Fault => "Fault",
            Self::Invalid => "Invalid",
            Self::BadConfig => "BadConfig",
            Self::NotSupported => "NotSupported",
            Self::Continue => "Continue",
            Self::NoData => "NoData",
            Self::Success => "Success",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error raised by the memory, buffer and flow unit contracts
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct FlowError {
    code: StatusCode,
    message: String,
}

impl FlowError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn fault(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Fault, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Invalid, message)
    }

    pub fn bad_config(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BadConfig, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotSupported, message)
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type Result<T, E = FlowError> = std::result::Result<T, E>;
