use serde::{Deserialize, Serialize};

/// Per-stream states of a reconnecting source
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StreamState {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Retrying { attempt: u32 },
    Stopped,
    Failed { error_msg: String },
}

impl StreamState {
    /// Check if transition from current state to target state is valid
    pub fn can_transition_to(&self, target: &StreamState) -> bool {
        use StreamState::*;

        matches!(
            (self, target),
            // From Idle
            (Idle, Connecting) |

            // From Connecting
            (Connecting, Streaming) |
            (Connecting, Retrying { .. }) |
            (Connecting, Stopped) |
            (Connecting, Failed { .. }) |

            // From Streaming
            (Streaming, Retrying { .. }) |
            (Streaming, Stopped) |
            (Streaming, Failed { .. }) |

            // From Retrying
            (Retrying { .. }, Streaming) |
            (Retrying { .. }, Retrying { .. }) |
            (Retrying { .. }, Stopped) |
            (Retrying { .. }, Failed { .. })
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed { .. })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::Streaming => "Streaming",
            Self::Retrying { .. } => "Retrying",
            Self::Stopped => "Stopped",
            Self::Failed { .. } => "Failed",
        }
    }
}
