//! Display scheduler: reveals buffered text at a fixed pace
//!
//! The scheduler runs as its own task and exclusively owns the turn's
//! [`RevealBuffer`]. The stream reader only talks to it through a
//! [`RevealFeed`], so there is exactly one writer and one drainer per turn.
//!
//! ```text
//!  reader ── append/replace/finish ──▶ feed channel ──▶ scheduler ── tick ──▶ on_reveal
//! ```
//!
//! Every queued feed item is applied before a tick reads the buffer, so a tick
//! always sees the latest text. While the reveal has caught up with the
//! received text the scheduler parks on the feed instead of ticking.

use crate::reveal::RevealBuffer;
use crate::turn::TurnId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Receives every newly revealed prefix of the reply
pub type RevealCallback = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Debug)]
enum FeedEvent {
    Append(String),
    Replace(String),
    Exhausted,
}

/// Writer side of a scheduler's reveal buffer
#[derive(Debug, Clone)]
pub struct RevealFeed {
    tx: mpsc::UnboundedSender<FeedEvent>,
}

impl RevealFeed {
    pub fn append(&self, text: impl Into<String>) {
        let _ = self.tx.send(FeedEvent::Append(text.into()));
    }

    /// Replace everything received so far
    pub fn replace(&self, text: impl Into<String>) {
        let _ = self.tx.send(FeedEvent::Replace(text.into()));
    }

    /// No more text will arrive
    pub fn finish(&self) {
        let _ = self.tx.send(FeedEvent::Exhausted);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RevealPace {
    pub interval: Duration,
    pub chars_per_tick: usize,
}

struct RevealScheduler {
    feed: mpsc::UnboundedReceiver<FeedEvent>,
    buffer: RevealBuffer,
    pace: RevealPace,
    cancel: CancellationToken,
    on_reveal: RevealCallback,
}

impl RevealScheduler {
    fn apply(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Append(text) => self.buffer.append(&text),
            FeedEvent::Replace(text) => self.buffer.replace(&text),
            FeedEvent::Exhausted => self.buffer.mark_exhausted(),
        }
    }

    fn apply_pending(&mut self) {
        while let Ok(event) = self.feed.try_recv() {
            self.apply(event);
        }
    }

    /// Returns the frozen text once drained, or None when cancelled
    async fn run(mut self) -> Option<String> {
        let mut ticker = tokio::time::interval(self.pace.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.apply_pending();

            if self.buffer.is_drained() {
                debug!(
                    "Reveal drained after {} characters",
                    self.buffer.revealed_len()
                );
                return Some(self.buffer.into_full_text());
            }

            if self.buffer.is_caught_up() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return None,
                    event = self.feed.recv() => {
                        match event {
                            Some(event) => self.apply(event),
                            // Writer is gone, nothing more can arrive
                            None => self.buffer.mark_exhausted(),
                        }
                        ticker.reset_immediately();
                    }
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                _ = ticker.tick() => {
                    self.apply_pending();
                    if self.buffer.tick(self.pace.chars_per_tick) {
                        if self.cancel.is_cancelled() {
                            return None;
                        }
                        trace!(
                            "Revealed {}/{} characters",
                            self.buffer.revealed_len(),
                            self.buffer.total_len()
                        );
                        (self.on_reveal)(self.buffer.revealed());
                    }
                }
            }
        }
    }
}

/// A started scheduler: the feed to write into and the final text once drained
pub struct ScheduledReveal {
    pub feed: RevealFeed,
    /// Resolves with the frozen text, or errors if the scheduler was stopped
    pub finished: oneshot::Receiver<String>,
}

struct ActiveScheduler {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct RegistryInner {
    next_generation: u64,
    active: HashMap<TurnId, ActiveScheduler>,
}

/// Tracks the running scheduler of each turn. At most one per turn id.
#[derive(Clone, Default)]
pub struct SchedulerRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start revealing for `turn_id`, first stopping and joining any scheduler
    /// already running for it.
    pub async fn start(
        &self,
        turn_id: &TurnId,
        pace: RevealPace,
        cancel: CancellationToken,
        on_reveal: RevealCallback,
    ) -> ScheduledReveal {
        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let scheduler = RevealScheduler {
            feed: rx,
            buffer: RevealBuffer::new(),
            pace,
            cancel: cancel.clone(),
            on_reveal,
        };

        // A concurrent start may claim the slot while we join the previous
        // scheduler, so only launch once the slot is empty under the lock.
        loop {
            let previous = {
                let mut inner = self.lock();
                match inner.active.remove(turn_id) {
                    Some(previous) => previous,
                    None => {
                        self.launch(&mut inner, turn_id, scheduler, cancel, done_tx);
                        break;
                    }
                }
            };
            Self::halt(turn_id, previous).await;
        }

        ScheduledReveal {
            feed: RevealFeed { tx },
            finished: done_rx,
        }
    }

    fn launch(
        &self,
        inner: &mut RegistryInner,
        turn_id: &TurnId,
        scheduler: RevealScheduler,
        cancel: CancellationToken,
        done_tx: oneshot::Sender<String>,
    ) {
        inner.next_generation += 1;
        let generation = inner.next_generation;

        let registry = self.clone();
        let owner = turn_id.clone();
        let task = tokio::spawn(async move {
            if let Some(text) = scheduler.run().await {
                let _ = done_tx.send(text);
            }
            registry.release(&owner, generation);
        });

        debug!("Started reveal scheduler {} for turn {}", generation, turn_id);
        inner.active.insert(
            turn_id.clone(),
            ActiveScheduler {
                generation,
                cancel,
                task,
            },
        );
    }

    async fn halt(turn_id: &TurnId, previous: ActiveScheduler) {
        debug!(
            "Stopping reveal scheduler {} for turn {}",
            previous.generation, turn_id
        );
        previous.cancel.cancel();
        let _ = previous.task.await;
    }

    /// Stop the scheduler for `turn_id` and wait until it can no longer publish
    pub async fn stop(&self, turn_id: &TurnId) {
        let previous = self.lock().active.remove(turn_id);
        if let Some(previous) = previous {
            Self::halt(turn_id, previous).await;
        }
    }

    pub fn is_active(&self, turn_id: &TurnId) -> bool {
        self.lock().active.contains_key(turn_id)
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    fn release(&self, turn_id: &TurnId, generation: u64) {
        let mut inner = self.lock();
        if inner
            .active
            .get(turn_id)
            .is_some_and(|active| active.generation == generation)
        {
            inner.active.remove(turn_id);
        }
    }
}
