use crate::turn::{MessageId, Turn, TurnId};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the reply text of a finished turn came about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    /// The service delivered the reply
    Delivered,
    /// The service sent an error frame
    UpstreamError,
    /// The connection failed and the reply is the apology text
    TransportFailure,
}

/// A turn whose reply is frozen, ready to be stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedTurn {
    pub turn_id: TurnId,
    pub message_id: MessageId,
    pub conversation_id: String,
    pub user_content: String,
    pub reply: String,
    pub outcome: TurnOutcome,
    pub completed_at: DateTime<Utc>,
}

/// Durable storage for finished turns
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a finished turn to its conversation. Called once per turn, never retried.
    async fn save_turn(&self, turn: &FinalizedTurn) -> Result<()>;
}

/// Finished turns of a conversation plus the single turn still in flight
#[derive(Debug, Default)]
pub struct MessageList {
    finalized: Vec<FinalizedTurn>,
    in_flight: Option<Turn>,
}

impl MessageList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(history: Vec<FinalizedTurn>) -> Self {
        Self {
            finalized: history,
            in_flight: None,
        }
    }

    pub fn finalized(&self) -> &[FinalizedTurn] {
        &self.finalized
    }

    pub fn in_flight(&self) -> Option<&Turn> {
        self.in_flight.as_ref()
    }

    /// The in-flight turn, if it is the one with `turn_id`
    pub fn in_flight_mut(&mut self, turn_id: &TurnId) -> Option<&mut Turn> {
        self.in_flight.as_mut().filter(|turn| turn.id() == turn_id)
    }

    /// Start tracking a new turn. Hands the turn back if one is already in flight.
    pub fn begin(&mut self, turn: Turn) -> std::result::Result<(), Turn> {
        if self.in_flight.is_some() {
            return Err(turn);
        }
        self.in_flight = Some(turn);
        Ok(())
    }

    /// Splice the in-flight turn with `message_id` into the finished list
    pub fn finalize(&mut self, message_id: &MessageId, turn: FinalizedTurn) -> bool {
        let matches = self
            .in_flight
            .as_ref()
            .is_some_and(|current| current.message_id() == message_id);
        if !matches {
            return false;
        }
        self.in_flight = None;
        self.finalized.push(turn);
        true
    }

    /// Drop the in-flight turn without finishing it
    pub fn discard(&mut self, turn_id: &TurnId) -> Option<Turn> {
        if self.in_flight.as_ref().is_some_and(|turn| turn.id() == turn_id) {
            self.in_flight.take()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.finalized.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
