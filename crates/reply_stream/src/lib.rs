//! Incremental reply streaming and turn lifecycle engine
//!
//! This crate implements:
//! - Fragment sources over live HTTP bodies and recorded playback via the ChunkStream trait
//! - A frame decoder for the line-oriented `data: {json}` reply protocol
//! - A reveal buffer and a display scheduler that paces text independently of network bursts
//! - A per-conversation controller that drives each turn from submission to completion
//! - Cancellation that tears down reads and ticks without leaving a turn stuck
//! - Recording capabilities for debugging and testing

#[cfg(test)]
mod tests;

mod utils;

pub mod controller;
pub mod decoder;
pub mod error;
pub mod messages;
pub mod recording;
pub mod reveal;
pub mod scheduler;
pub mod settings;
pub mod source;
pub mod turn;

pub use controller::{ConversationController, TurnEvent};
pub use decoder::{FrameDecoder, FrameEvent};
pub use error::{StreamError, SubmitError, TransitionError};
pub use messages::{FinalizedTurn, MessageList, MessageStore, TurnOutcome};
pub use recording::{PlaybackState, StreamRecorder};
pub use reveal::{advance, RevealBuffer};
pub use scheduler::{RevealCallback, RevealFeed, RevealPace, ScheduledReveal, SchedulerRegistry};
pub use settings::StreamSettings;
pub use source::{
    ChunkStream, HttpChunkStream, HttpConnector, PlaybackChunkStream, PlaybackConnector,
    RecordingConnector, ReplyRequest, StreamConnector,
};
pub use turn::{MessageId, Turn, TurnId, TurnPhase, TurnState};
