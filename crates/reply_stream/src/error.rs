use crate::turn::TurnState;
use std::time::Duration;

/// Errors raised while acquiring or reading a fragment source
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("No data received for {0:?}")]
    Stalled(Duration),

    #[error("Stream cancelled")]
    Cancelled,
}

impl StreamError {
    /// Cancellation ends a read on purpose and must never take the failure path
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StreamError::Cancelled)
    }
}

/// Reasons a new submission is refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("A reply is still in flight for turn {0}")]
    TurnInFlight(String),

    #[error("Message is empty")]
    EmptyContent,

    #[error("Conversation has been shut down")]
    ShutDown,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid turn transition from {from:?} to {to:?}")]
pub struct TransitionError {
    pub from: TurnState,
    pub to: TurnState,
}
