//! Per-conversation turn driver
//!
//! A [`ConversationController`] accepts one submission at a time and runs it
//! on its own task: acquire the fragment source, pause briefly on the
//! placeholder, rename the reply entity, then pump decoded frames into the
//! turn's reveal scheduler until it drains. Every step publishes a
//! [`TurnEvent`] so a front end can mirror the turn without polling.
//!
//! Cancellation is a token per turn, derived from the controller's own
//! shutdown token. Cancelling stops the read, the display tick and any further
//! publication, and then discards the turn from the message list.

use crate::decoder::{FrameDecoder, FrameEvent};
use crate::error::{StreamError, SubmitError};
use crate::messages::{FinalizedTurn, MessageList, MessageStore, TurnOutcome};
use crate::scheduler::{RevealCallback, RevealFeed, RevealPace, SchedulerRegistry};
use crate::settings::StreamSettings;
use crate::source::{ChunkStream, ReplyRequest, StreamConnector};
use crate::turn::{MessageId, Turn, TurnId, TurnState};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Everything observable about a turn, in the order it happened
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    StateChanged {
        turn_id: TurnId,
        message_id: MessageId,
        state: TurnState,
    },
    /// The placeholder became the streaming reply under a new id
    MessageRenamed {
        turn_id: TurnId,
        from: MessageId,
        to: MessageId,
    },
    /// A longer prefix of the reply is visible
    Revealed {
        turn_id: TurnId,
        message_id: MessageId,
        content: String,
    },
    /// The turn was spliced into the finished list
    Finalized(FinalizedTurn),
    /// The turn was cancelled before it finished
    Discarded { turn_id: TurnId },
    Saved { turn_id: TurnId },
    /// The store rejected the finished turn. Not retried.
    SaveFailed { turn_id: TurnId, error: String },
}

type SharedMessages = Arc<Mutex<MessageList>>;

fn lock_messages(messages: &SharedMessages) -> MutexGuard<'_, MessageList> {
    messages.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ActiveTurn {
    turn_id: TurnId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Drives the turns of one conversation, one in flight at a time
pub struct ConversationController {
    conversation_id: String,
    connector: Arc<dyn StreamConnector>,
    store: Arc<dyn MessageStore>,
    settings: StreamSettings,
    messages: SharedMessages,
    schedulers: SchedulerRegistry,
    events: mpsc::UnboundedSender<TurnEvent>,
    shutdown: CancellationToken,
    active: Option<ActiveTurn>,
}

impl ConversationController {
    pub fn new(
        conversation_id: impl Into<String>,
        connector: Arc<dyn StreamConnector>,
        store: Arc<dyn MessageStore>,
        settings: StreamSettings,
    ) -> (Self, mpsc::UnboundedReceiver<TurnEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let controller = Self {
            conversation_id: conversation_id.into(),
            connector,
            store,
            settings,
            messages: Arc::new(Mutex::new(MessageList::new())),
            schedulers: SchedulerRegistry::new(),
            events,
            shutdown: CancellationToken::new(),
            active: None,
        };
        (controller, receiver)
    }

    /// Seed the finished list, e.g. with turns loaded from storage
    pub fn with_history(self, history: Vec<FinalizedTurn>) -> Self {
        *lock_messages(&self.messages) = MessageList::with_history(history);
        self
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    #[cfg(test)]
    pub(crate) fn scheduler_registry(&self) -> &SchedulerRegistry {
        &self.schedulers
    }

    pub fn finalized_turns(&self) -> Vec<FinalizedTurn> {
        lock_messages(&self.messages).finalized().to_vec()
    }

    /// Snapshot of the turn still in flight
    pub fn in_flight(&self) -> Option<Turn> {
        lock_messages(&self.messages).in_flight().cloned()
    }

    pub fn is_streaming(&self) -> bool {
        lock_messages(&self.messages)
            .in_flight()
            .is_some_and(Turn::is_streaming)
    }

    pub fn is_loading(&self) -> bool {
        lock_messages(&self.messages)
            .in_flight()
            .is_some_and(Turn::is_loading)
    }

    /// Whether a front end should accept input right now
    pub fn input_enabled(&self) -> bool {
        !self.shutdown.is_cancelled() && lock_messages(&self.messages).in_flight().is_none()
    }

    /// Accept a user message and start streaming its reply.
    ///
    /// Must be called from within a Tokio runtime. The turn is already in
    /// `Placeholder` when this returns.
    pub fn submit(&mut self, content: impl Into<String>) -> Result<TurnId, SubmitError> {
        if self.shutdown.is_cancelled() {
            return Err(SubmitError::ShutDown);
        }
        let content = content.into();
        if content.trim().is_empty() {
            return Err(SubmitError::EmptyContent);
        }

        let mut turn = Turn::new(content);
        let turn_id = turn.id().clone();
        let message_id = turn.message_id().clone();
        {
            let mut messages = lock_messages(&self.messages);
            if let Some(current) = messages.in_flight() {
                debug!("Rejecting submission, turn {} still in flight", current.id());
                return Err(SubmitError::TurnInFlight(current.id().to_string()));
            }

            self.emit(TurnEvent::StateChanged {
                turn_id: turn_id.clone(),
                message_id: message_id.clone(),
                state: TurnState::Submitted,
            });
            if let Err(e) = turn.show_placeholder() {
                warn!("Fresh turn refused placeholder: {}", e);
            }
            self.emit(TurnEvent::StateChanged {
                turn_id: turn_id.clone(),
                message_id: message_id.clone(),
                state: TurnState::Placeholder,
            });

            if let Err(turn) = messages.begin(turn) {
                return Err(SubmitError::TurnInFlight(turn.id().to_string()));
            }
        }

        info!(
            "Submitted turn {} in conversation {}",
            turn_id, self.conversation_id
        );

        let cancel = self.shutdown.child_token();
        let driver = TurnDriver {
            turn_id: turn_id.clone(),
            conversation_id: self.conversation_id.clone(),
            connector: self.connector.clone(),
            store: self.store.clone(),
            settings: self.settings.clone(),
            messages: self.messages.clone(),
            schedulers: self.schedulers.clone(),
            events: self.events.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(driver.run());

        self.active = Some(ActiveTurn {
            turn_id: turn_id.clone(),
            cancel,
            task,
        });
        Ok(turn_id)
    }

    /// Abort the current turn, if any, and discard it unless it already finished.
    /// Safe to call any number of times.
    pub async fn cancel(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        active.cancel.cancel();
        self.schedulers.stop(&active.turn_id).await;
        if let Err(e) = active.task.await {
            if e.is_panic() {
                warn!("Turn {} task panicked: {}", active.turn_id, e);
            }
        }

        let discarded = lock_messages(&self.messages).discard(&active.turn_id);
        if discarded.is_some() {
            info!("Discarded turn {}", active.turn_id);
            self.emit(TurnEvent::Discarded {
                turn_id: active.turn_id,
            });
        }
    }

    /// Wait for the current turn to finish on its own, save included.
    ///
    /// Dropping this future early leaves the turn running and cancellable.
    pub async fn wait_idle(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if let Err(e) = (&mut active.task).await {
            warn!("Turn {} task ended abnormally: {}", active.turn_id, e);
        }
        self.active = None;
    }

    /// Cancel everything and refuse further submissions
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        self.cancel().await;
    }

    fn emit(&self, event: TurnEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

impl Drop for ConversationController {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// State moved into the task that drives a single turn
struct TurnDriver {
    turn_id: TurnId,
    conversation_id: String,
    connector: Arc<dyn StreamConnector>,
    store: Arc<dyn MessageStore>,
    settings: StreamSettings,
    messages: SharedMessages,
    schedulers: SchedulerRegistry,
    events: mpsc::UnboundedSender<TurnEvent>,
    cancel: CancellationToken,
}

impl TurnDriver {
    async fn run(self) {
        let request = ReplyRequest {
            conversation_id: self.conversation_id.clone(),
            message: self.user_content(),
        };

        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            result = self.connector.connect(&request) => result,
        };
        let mut stream = match connected {
            Ok(stream) => stream,
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                warn!("Could not open reply stream for turn {}: {}", self.turn_id, e);
                self.finish_failed().await;
                return;
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(self.settings.pacing_delay()) => {}
        }

        let Some(message_id) = self.begin_streaming() else {
            return;
        };

        let pace = RevealPace {
            interval: self.settings.reveal_interval(),
            chars_per_tick: self.settings.chars_per_tick(),
        };
        // Own token so stopping the scheduler never reads as cancelling the turn
        let reveal = self
            .schedulers
            .start(
                &self.turn_id,
                pace,
                self.cancel.child_token(),
                self.reveal_callback(message_id),
            )
            .await;

        let pumped = self.pump(stream.as_mut(), &reveal.feed).await;
        // Release the source before the turn can finish and admit the next one
        drop(stream);

        match pumped {
            Ok(outcome) => {
                reveal.feed.finish();
                let finished = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return,
                    finished = reveal.finished => finished,
                };
                match finished {
                    Ok(text) => self.finish(text, outcome).await,
                    // Whoever cancelled the turn owns it now
                    Err(_) if self.cancel.is_cancelled() => {}
                    Err(_) => {
                        warn!("Reveal for turn {} stopped before draining", self.turn_id);
                        self.finish_failed().await;
                    }
                }
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                warn!("Reply stream for turn {} failed: {}", self.turn_id, e);
                self.schedulers.stop(&self.turn_id).await;
                self.finish_failed().await;
            }
        }
    }

    fn emit(&self, event: TurnEvent) {
        let _ = self.events.send(event);
    }

    fn user_content(&self) -> String {
        lock_messages(&self.messages)
            .in_flight()
            .filter(|turn| turn.id() == &self.turn_id)
            .map(|turn| turn.user_content().to_string())
            .unwrap_or_default()
    }

    /// Placeholder to streaming under a fresh message id
    fn begin_streaming(&self) -> Option<MessageId> {
        let mut messages = lock_messages(&self.messages);
        if self.cancel.is_cancelled() {
            return None;
        }
        let turn = messages.in_flight_mut(&self.turn_id)?;

        let streaming_id = MessageId::streaming();
        match turn.begin_streaming(streaming_id.clone()) {
            Ok(placeholder_id) => {
                debug!(
                    "Turn {} renamed {} -> {}",
                    self.turn_id, placeholder_id, streaming_id
                );
                self.emit(TurnEvent::MessageRenamed {
                    turn_id: self.turn_id.clone(),
                    from: placeholder_id,
                    to: streaming_id.clone(),
                });
                self.emit(TurnEvent::StateChanged {
                    turn_id: self.turn_id.clone(),
                    message_id: streaming_id.clone(),
                    state: TurnState::Streaming,
                });
                Some(streaming_id)
            }
            Err(e) => {
                warn!("Turn {} could not start streaming: {}", self.turn_id, e);
                None
            }
        }
    }

    fn reveal_callback(&self, message_id: MessageId) -> RevealCallback {
        let messages = self.messages.clone();
        let events = self.events.clone();
        let turn_id = self.turn_id.clone();
        let cancel = self.cancel.clone();

        Box::new(move |revealed: &str| {
            if cancel.is_cancelled() {
                return;
            }
            let mut messages = lock_messages(&messages);
            let Some(turn) = messages.in_flight_mut(&turn_id) else {
                return;
            };
            if turn.reveal(revealed).is_ok() {
                let _ = events.send(TurnEvent::Revealed {
                    turn_id: turn_id.clone(),
                    message_id: message_id.clone(),
                    content: revealed.to_string(),
                });
            }
        })
    }

    /// Read and decode until a terminal frame or the end of the source
    async fn pump(
        &self,
        stream: &mut dyn ChunkStream,
        feed: &RevealFeed,
    ) -> Result<TurnOutcome, StreamError> {
        let mut decoder = FrameDecoder::new();
        let mut received_content = false;
        let mut outcome = TurnOutcome::Delivered;

        loop {
            let chunk = self.read_chunk(stream).await?;
            let exhausted = chunk.is_none();
            let events = match chunk {
                Some(bytes) => {
                    trace!("Turn {} received {} bytes", self.turn_id, bytes.len());
                    decoder.push(&bytes)
                }
                None => decoder.finish(),
            };

            for event in events {
                match event {
                    FrameEvent::Content(text) => {
                        if !text.is_empty() {
                            received_content = true;
                            feed.append(text);
                        }
                    }
                    FrameEvent::Complete => {
                        debug!("Turn {} stream complete", self.turn_id);
                    }
                    FrameEvent::Error(message) => {
                        warn!("Service reported error for turn {}: {}", self.turn_id, message);
                        outcome = TurnOutcome::UpstreamError;
                        if !received_content {
                            feed.replace(self.settings.upstream_error_text(&message));
                        }
                    }
                    FrameEvent::Signal { kind, .. } => {
                        debug!("Ignoring '{}' frame for turn {}", kind, self.turn_id);
                    }
                }
            }

            if exhausted || decoder.is_finished() {
                return Ok(outcome);
            }
        }
    }

    async fn read_chunk(
        &self,
        stream: &mut dyn ChunkStream,
    ) -> Result<Option<Vec<u8>>, StreamError> {
        let stall_timeout = self.settings.stall_timeout();
        let read = async {
            match stall_timeout {
                Some(limit) => match tokio::time::timeout(limit, stream.next_chunk()).await {
                    Ok(result) => result,
                    Err(_) => Err(StreamError::Stalled(limit)),
                },
                None => stream.next_chunk().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StreamError::Cancelled),
            result = read => result,
        }
    }

    async fn finish(&self, text: String, outcome: TurnOutcome) {
        if let Some(finalized) = self.finalize(text, outcome) {
            self.save(finalized).await;
        }
    }

    async fn finish_failed(&self) {
        let apology = self.settings.transport_error_message.clone();
        if let Some(finalized) = self.finalize(apology, TurnOutcome::TransportFailure) {
            self.save(finalized).await;
        }
    }

    /// Move the turn to `Complete` and splice it into the finished list
    fn finalize(&self, text: String, outcome: TurnOutcome) -> Option<FinalizedTurn> {
        let mut messages = lock_messages(&self.messages);
        if self.cancel.is_cancelled() {
            return None;
        }
        let turn = messages.in_flight_mut(&self.turn_id)?;

        if outcome == TurnOutcome::TransportFailure {
            if let Err(e) = turn.fail(text.as_str()) {
                warn!("Turn {} could not fail: {}", self.turn_id, e);
                return None;
            }
            self.emit(TurnEvent::StateChanged {
                turn_id: self.turn_id.clone(),
                message_id: turn.message_id().clone(),
                state: TurnState::Failed,
            });
        }

        if let Err(e) = turn.complete(text) {
            warn!("Turn {} could not complete: {}", self.turn_id, e);
            return None;
        }
        self.emit(TurnEvent::StateChanged {
            turn_id: self.turn_id.clone(),
            message_id: turn.message_id().clone(),
            state: TurnState::Complete,
        });

        let finalized = FinalizedTurn {
            turn_id: self.turn_id.clone(),
            message_id: turn.message_id().clone(),
            conversation_id: self.conversation_id.clone(),
            user_content: turn.user_content().to_string(),
            reply: turn.revealed_content().to_string(),
            outcome,
            completed_at: chrono::Utc::now(),
        };
        let message_id = finalized.message_id.clone();
        messages.finalize(&message_id, finalized.clone());
        drop(messages);

        info!(
            "Turn {} complete ({:?}, {} characters)",
            self.turn_id,
            outcome,
            finalized.reply.chars().count()
        );
        self.emit(TurnEvent::Finalized(finalized.clone()));
        Some(finalized)
    }

    async fn save(&self, finalized: FinalizedTurn) {
        match self.store.save_turn(&finalized).await {
            Ok(()) => self.emit(TurnEvent::Saved {
                turn_id: finalized.turn_id,
            }),
            Err(e) => self.emit(TurnEvent::SaveFailed {
                turn_id: finalized.turn_id,
                error: format!("{e:#}"),
            }),
        }
    }
}
