use crate::error::TransitionError;
use serde::{Deserialize, Serialize};
use std::fmt;

fn generate_id(prefix: &str) -> String {
    let timestamp = chrono::Utc::now().timestamp_millis();
    let random_part: u32 = rand::random();
    format!("{prefix}_{timestamp}_{random_part:08x}")
}

/// Identifies one turn for its whole lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TurnId(String);

impl TurnId {
    pub fn new() -> Self {
        Self(generate_id("turn"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies the displayed reply entity. The placeholder and the streaming
/// reply are the same reply under two different ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn placeholder() -> Self {
        Self(generate_id("placeholder"))
    }

    pub fn streaming() -> Self {
        Self(generate_id("msg"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnState {
    Submitted,
    Placeholder,
    Streaming,
    Complete,
    Failed,
}

/// Lifecycle phase of a turn, carrying only the data valid in that phase
#[derive(Debug, Clone, PartialEq)]
pub enum TurnPhase {
    Submitted,
    Placeholder,
    Streaming { revealed: String },
    /// Transport failure; `text` is the apology shown instead of the reply
    Failed { text: String },
    Complete { text: String },
}

impl TurnPhase {
    pub fn state(&self) -> TurnState {
        match self {
            TurnPhase::Submitted => TurnState::Submitted,
            TurnPhase::Placeholder => TurnState::Placeholder,
            TurnPhase::Streaming { .. } => TurnState::Streaming,
            TurnPhase::Failed { .. } => TurnState::Failed,
            TurnPhase::Complete { .. } => TurnState::Complete,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Turn {
    id: TurnId,
    message_id: MessageId,
    user_content: String,
    phase: TurnPhase,
    history: Vec<TurnState>,
}

impl Turn {
    pub fn new(user_content: impl Into<String>) -> Self {
        Self {
            id: TurnId::new(),
            message_id: MessageId::placeholder(),
            user_content: user_content.into(),
            phase: TurnPhase::Submitted,
            history: vec![TurnState::Submitted],
        }
    }

    pub fn id(&self) -> &TurnId {
        &self.id
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn user_content(&self) -> &str {
        &self.user_content
    }

    pub fn phase(&self) -> &TurnPhase {
        &self.phase
    }

    pub fn state(&self) -> TurnState {
        self.phase.state()
    }

    /// Every state this turn has been in, oldest first
    pub fn history(&self) -> &[TurnState] {
        &self.history
    }

    /// Text currently shown for the reply
    pub fn revealed_content(&self) -> &str {
        match &self.phase {
            TurnPhase::Submitted | TurnPhase::Placeholder => "",
            TurnPhase::Streaming { revealed } => revealed,
            TurnPhase::Failed { text } | TurnPhase::Complete { text } => text,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.phase, TurnPhase::Submitted | TurnPhase::Placeholder)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.phase, TurnPhase::Streaming { .. })
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.phase, TurnPhase::Complete { .. })
    }

    pub fn show_placeholder(&mut self) -> Result<(), TransitionError> {
        match self.phase {
            TurnPhase::Submitted => {
                self.set_phase(TurnPhase::Placeholder);
                Ok(())
            }
            _ => Err(self.invalid(TurnState::Placeholder)),
        }
    }

    /// Move to streaming under a new message id, returning the placeholder id
    pub fn begin_streaming(&mut self, message_id: MessageId) -> Result<MessageId, TransitionError> {
        match self.phase {
            TurnPhase::Placeholder => {
                self.set_phase(TurnPhase::Streaming {
                    revealed: String::new(),
                });
                Ok(std::mem::replace(&mut self.message_id, message_id))
            }
            _ => Err(self.invalid(TurnState::Streaming)),
        }
    }

    /// Publish a longer prefix of the reply. Shorter text is rejected.
    pub fn reveal(&mut self, content: &str) -> Result<(), TransitionError> {
        let from = self.state();
        match &mut self.phase {
            TurnPhase::Streaming { revealed } if content.len() >= revealed.len() => {
                revealed.clear();
                revealed.push_str(content);
                Ok(())
            }
            _ => Err(TransitionError {
                from,
                to: TurnState::Streaming,
            }),
        }
    }

    pub fn fail(&mut self, text: impl Into<String>) -> Result<(), TransitionError> {
        match self.phase {
            TurnPhase::Placeholder | TurnPhase::Streaming { .. } => {
                self.set_phase(TurnPhase::Failed { text: text.into() });
                Ok(())
            }
            _ => Err(self.invalid(TurnState::Failed)),
        }
    }

    /// Freeze the reply. A failed turn completes with its apology text.
    pub fn complete(&mut self, text: impl Into<String>) -> Result<(), TransitionError> {
        let from = self.state();
        let text = match &mut self.phase {
            TurnPhase::Streaming { .. } => text.into(),
            TurnPhase::Failed { text } => std::mem::take(text),
            _ => {
                return Err(TransitionError {
                    from,
                    to: TurnState::Complete,
                })
            }
        };
        self.set_phase(TurnPhase::Complete { text });
        Ok(())
    }

    fn set_phase(&mut self, phase: TurnPhase) {
        self.history.push(phase.state());
        self.phase = phase;
    }

    fn invalid(&self, to: TurnState) -> TransitionError {
        TransitionError {
            from: self.state(),
            to,
        }
    }
}
