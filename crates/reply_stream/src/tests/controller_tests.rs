use super::mocks::*;
use crate::controller::{ConversationController, TurnEvent};
use crate::error::{StreamError, SubmitError};
use crate::messages::{FinalizedTurn, MessageStore, TurnOutcome};
use crate::settings::{
    StreamSettings, DEFAULT_TRANSPORT_ERROR_MESSAGE, DEFAULT_UPSTREAM_ERROR_FALLBACK,
};
use crate::source::{ChunkStream, ReplyRequest, StreamConnector};
use crate::turn::TurnState::{Complete, Failed, Placeholder, Streaming, Submitted};
use crate::turn::{MessageId, TurnId};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn controller_with(
    connector: Arc<ScriptedConnector>,
    store: Arc<MemoryStore>,
    settings: StreamSettings,
) -> (
    ConversationController,
    tokio::sync::mpsc::UnboundedReceiver<TurnEvent>,
) {
    ConversationController::new("conv-1", connector, store, settings)
}

async fn run_single_turn(steps: Vec<Step>) -> (Vec<TurnEvent>, Vec<FinalizedTurn>, Arc<MemoryStore>) {
    let connector = Arc::new(ScriptedConnector::streaming(steps));
    let store = Arc::new(MemoryStore::default());
    let (mut controller, mut events) = controller_with(connector, store.clone(), test_settings());

    controller.submit("Hi").unwrap();
    controller.wait_idle().await;

    let events = drain(&mut events);
    (events, controller.finalized_turns(), store)
}

#[tokio::test(start_paused = true)]
async fn fragments_are_concatenated_into_final_reply() {
    let (events, finalized, store) = run_single_turn(vec![
        chunk(&delta("Hello")),
        chunk(&delta(" there")),
        chunk(&delta("!")),
        chunk(&complete_frame()),
    ])
    .await;

    assert_eq!(states(&events), vec![Submitted, Placeholder, Streaming, Complete]);
    assert_eq!(finalized.len(), 1);
    assert_eq!(finalized[0].reply, "Hello there!");
    assert_eq!(finalized[0].user_content, "Hi");
    assert_eq!(finalized[0].conversation_id, "conv-1");
    assert_eq!(finalized[0].outcome, TurnOutcome::Delivered);
    assert_eq!(revealed(&events).last().unwrap(), "Hello there!");
    assert_eq!(store.saved(), finalized);
    assert!(matches!(events.last(), Some(TurnEvent::Saved { .. })));
}

#[tokio::test(start_paused = true)]
async fn reveal_grows_one_character_at_a_time() {
    let (events, finalized, _) = run_single_turn(vec![
        chunk(&delta("héllo ")),
        Step::Delay(Duration::from_millis(40)),
        chunk(&delta("wörld")),
        chunk(&complete_frame()),
    ])
    .await;

    let reply = &finalized[0].reply;
    assert_eq!(reply, "héllo wörld");

    let prefixes = revealed(&events);
    assert_eq!(prefixes.len(), reply.chars().count());
    for (i, prefix) in prefixes.iter().enumerate() {
        assert_eq!(prefix.chars().count(), i + 1);
        assert!(reply.starts_with(prefix.as_str()));
    }
}

#[tokio::test(start_paused = true)]
async fn placeholder_is_renamed_when_streaming_starts() {
    let (events, finalized, _) =
        run_single_turn(vec![chunk(&delta("ok")), chunk(&complete_frame())]).await;

    let placeholder_id = match &events[0] {
        TurnEvent::StateChanged { message_id, .. } => message_id.clone(),
        other => panic!("unexpected first event {other:?}"),
    };
    let (from, to) = events
        .iter()
        .find_map(|event| match event {
            TurnEvent::MessageRenamed { from, to, .. } => Some((from.clone(), to.clone())),
            _ => None,
        })
        .unwrap();

    assert_eq!(from, placeholder_id);
    assert_ne!(to, placeholder_id);
    assert_eq!(finalized[0].message_id, to);
    for event in &events {
        if let TurnEvent::Revealed { message_id, .. } = event {
            assert_eq!(message_id, &to);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn transport_error_mid_stream_replaces_partial_reply() {
    let (events, finalized, store) = run_single_turn(vec![
        chunk(&delta("Partial")),
        Step::Delay(Duration::from_millis(3)),
        Step::Fail("connection reset".to_string()),
    ])
    .await;

    assert_eq!(
        states(&events),
        vec![Submitted, Placeholder, Streaming, Failed, Complete]
    );
    assert_eq!(finalized[0].reply, DEFAULT_TRANSPORT_ERROR_MESSAGE);
    assert_eq!(finalized[0].outcome, TurnOutcome::TransportFailure);
    assert_eq!(store.saved().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_failure_fails_from_placeholder() {
    let connector = Arc::new(ScriptedConnector::new(vec![Connect::Fail(
        StreamError::Status {
            status: 500,
            body: "internal".to_string(),
        },
    )]));
    let store = Arc::new(MemoryStore::default());
    let (mut controller, mut events) = controller_with(connector, store, test_settings());

    controller.submit("Hi").unwrap();
    controller.wait_idle().await;

    let events = drain(&mut events);
    assert_eq!(states(&events), vec![Submitted, Placeholder, Failed, Complete]);
    assert_eq!(
        controller.finalized_turns()[0].reply,
        DEFAULT_TRANSPORT_ERROR_MESSAGE
    );
    assert!(controller.input_enabled());
}

#[tokio::test(start_paused = true)]
async fn upstream_error_before_content_is_displayed() {
    let (events, finalized, _) = run_single_turn(vec![chunk(&error_frame("model overloaded"))]).await;

    assert_eq!(states(&events), vec![Submitted, Placeholder, Streaming, Complete]);
    assert_eq!(finalized[0].reply, "model overloaded");
    assert_eq!(finalized[0].outcome, TurnOutcome::UpstreamError);
    assert_eq!(revealed(&events).len(), "model overloaded".len());
}

#[tokio::test(start_paused = true)]
async fn empty_upstream_error_uses_fallback_text() {
    let (_, finalized, _) = run_single_turn(vec![chunk(&error_frame(""))]).await;
    assert_eq!(finalized[0].reply, DEFAULT_UPSTREAM_ERROR_FALLBACK);
}

#[tokio::test(start_paused = true)]
async fn upstream_error_after_content_keeps_content() {
    let (_, finalized, _) =
        run_single_turn(vec![chunk(&delta("Half a reply")), chunk(&error_frame("boom"))]).await;

    assert_eq!(finalized[0].reply, "Half a reply");
    assert_eq!(finalized[0].outcome, TurnOutcome::UpstreamError);
}

#[tokio::test(start_paused = true)]
async fn end_of_stream_without_complete_frame_completes() {
    let (events, finalized, _) = run_single_turn(vec![chunk(&delta("No terminator"))]).await;

    assert_eq!(states(&events).last(), Some(&Complete));
    assert_eq!(finalized[0].reply, "No terminator");
    assert_eq!(finalized[0].outcome, TurnOutcome::Delivered);
}

#[tokio::test(start_paused = true)]
async fn frames_split_across_chunks_are_reassembled() {
    let wire = format!("{}{}", delta("Grüße, Welt"), complete_frame());
    let steps = wire
        .as_bytes()
        .chunks(3)
        .map(|piece| Step::Chunk(piece.to_vec()))
        .collect();

    let (_, finalized, _) = run_single_turn(steps).await;
    assert_eq!(finalized[0].reply, "Grüße, Welt");
}

#[tokio::test(start_paused = true)]
async fn malformed_and_unknown_frames_do_not_drop_the_reply() {
    let (_, finalized, _) = run_single_turn(vec![
        chunk(&delta("Start ")),
        chunk("data: {\"type\":\"typing\"}\n\n"),
        chunk("data: {broken\n\n"),
        chunk(&complete_frame()),
        chunk(&delta("after complete")),
    ])
    .await;

    assert_eq!(finalized[0].reply, "Start {broken");
}

#[tokio::test(start_paused = true)]
async fn empty_reply_still_completes() {
    let (events, finalized, _) = run_single_turn(vec![chunk(&complete_frame())]).await;

    assert_eq!(states(&events), vec![Submitted, Placeholder, Streaming, Complete]);
    assert_eq!(finalized[0].reply, "");
    assert!(revealed(&events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn request_carries_conversation_and_content() {
    let connector = Arc::new(ScriptedConnector::streaming(vec![chunk(&complete_frame())]));
    let store = Arc::new(MemoryStore::default());
    let (mut controller, _events) =
        controller_with(connector.clone(), store, test_settings());

    controller.submit("What is Rust?").unwrap();
    controller.wait_idle().await;

    let requests = connector.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].conversation_id, "conv-1");
    assert_eq!(requests[0].message, "What is Rust?");
}

#[tokio::test(start_paused = true)]
async fn second_submission_is_rejected_while_in_flight() {
    let connector = Arc::new(ScriptedConnector::new(vec![
        Connect::Stream(vec![chunk(&delta("first")), Step::Stall]),
        Connect::Stream(vec![chunk(&delta("second")), chunk(&complete_frame())]),
    ]));
    let store = Arc::new(MemoryStore::default());
    let (mut controller, _events) =
        controller_with(connector.clone(), store, test_settings());

    let first = controller.submit("one").unwrap();
    assert!(controller.is_loading());
    assert!(!controller.input_enabled());
    assert_eq!(
        controller.submit("two"),
        Err(SubmitError::TurnInFlight(first.to_string()))
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(controller.is_streaming());
    assert!(matches!(
        controller.submit("two"),
        Err(SubmitError::TurnInFlight(_))
    ));

    controller.cancel().await;
    controller.submit("two").unwrap();
    controller.wait_idle().await;

    let finalized = controller.finalized_turns();
    assert_eq!(finalized.len(), 1);
    assert_eq!(finalized[0].user_content, "two");
    assert_eq!(finalized[0].reply, "second");

    let messages: Vec<String> = connector.requests().into_iter().map(|r| r.message).collect();
    assert_eq!(messages, vec!["one", "two"]);
}

#[tokio::test]
async fn blank_submission_is_rejected() {
    let connector = Arc::new(ScriptedConnector::default());
    let store = Arc::new(MemoryStore::default());
    let (mut controller, mut events) = controller_with(connector.clone(), store, test_settings());

    assert_eq!(controller.submit("  \n"), Err(SubmitError::EmptyContent));
    assert!(drain(&mut events).is_empty());
    assert!(connector.requests().is_empty());
    assert!(controller.input_enabled());
}

#[tokio::test(start_paused = true)]
async fn cancelling_mid_stream_discards_the_turn() {
    let connector = Arc::new(ScriptedConnector::streaming(vec![
        chunk(&delta("Hello")),
        Step::Stall,
    ]));
    let store = Arc::new(MemoryStore::default());
    let (mut controller, mut events) = controller_with(connector, store.clone(), test_settings());

    let turn_id = controller.submit("Hi").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(controller.is_streaming());
    assert_eq!(controller.in_flight().unwrap().revealed_content(), "Hello");

    controller.cancel().await;
    controller.cancel().await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let events = drain(&mut events);
    let discarded: Vec<&TurnId> = events
        .iter()
        .filter_map(|event| match event {
            TurnEvent::Discarded { turn_id } => Some(turn_id),
            _ => None,
        })
        .collect();
    assert_eq!(discarded, vec![&turn_id]);
    assert!(matches!(events.last(), Some(TurnEvent::Discarded { .. })));
    assert!(!states(&events).contains(&Complete));

    assert!(controller.finalized_turns().is_empty());
    assert!(controller.in_flight().is_none());
    assert!(store.saved().is_empty());
    assert!(controller.input_enabled());
}

#[tokio::test(start_paused = true)]
async fn cancelling_before_the_source_answers() {
    let connector = Arc::new(ScriptedConnector::new(vec![Connect::Hang]));
    let store = Arc::new(MemoryStore::default());
    let (mut controller, mut events) = controller_with(connector, store, test_settings());

    controller.submit("Hi").unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(controller.is_loading());

    controller.cancel().await;

    let events = drain(&mut events);
    assert_eq!(states(&events), vec![Submitted, Placeholder]);
    assert!(matches!(events.last(), Some(TurnEvent::Discarded { .. })));
    assert!(controller.in_flight().is_none());
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_finished_turn_is_a_no_op() {
    let connector = Arc::new(ScriptedConnector::streaming(vec![
        chunk(&delta("done")),
        chunk(&complete_frame()),
    ]));
    let store = Arc::new(MemoryStore::default());
    let (mut controller, mut events) = controller_with(connector, store, test_settings());

    controller.submit("Hi").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.cancel().await;

    let events = drain(&mut events);
    assert!(!events
        .iter()
        .any(|event| matches!(event, TurnEvent::Discarded { .. })));
    assert_eq!(controller.finalized_turns().len(), 1);
    assert_eq!(controller.finalized_turns()[0].reply, "done");
}

#[tokio::test(start_paused = true)]
async fn stalled_source_times_out_when_configured() {
    let connector = Arc::new(ScriptedConnector::streaming(vec![
        chunk(&delta("Slow")),
        Step::Stall,
    ]));
    let store = Arc::new(MemoryStore::default());
    let settings = StreamSettings {
        stall_timeout_ms: Some(100),
        ..test_settings()
    };
    let (mut controller, mut events) = controller_with(connector, store, settings);

    controller.submit("Hi").unwrap();
    controller.wait_idle().await;

    let events = drain(&mut events);
    assert_eq!(states(&events).last(), Some(&Complete));
    assert!(states(&events).contains(&Failed));
    assert_eq!(
        controller.finalized_turns()[0].outcome,
        TurnOutcome::TransportFailure
    );
}

#[tokio::test(start_paused = true)]
async fn save_failure_is_reported_not_retried() {
    let connector = Arc::new(ScriptedConnector::streaming(vec![
        chunk(&delta("kept")),
        chunk(&complete_frame()),
    ]));
    let (mut controller, mut events) = ConversationController::new(
        "conv-1",
        connector,
        Arc::new(FailingStore),
        test_settings(),
    );

    let turn_id = controller.submit("Hi").unwrap();
    controller.wait_idle().await;

    let events = drain(&mut events);
    let failures: Vec<&TurnEvent> = events
        .iter()
        .filter(|event| matches!(event, TurnEvent::SaveFailed { .. }))
        .collect();
    assert_eq!(failures.len(), 1);
    match failures[0] {
        TurnEvent::SaveFailed { turn_id: id, error } => {
            assert_eq!(id, &turn_id);
            assert!(error.contains("disk full"));
        }
        _ => unreachable!(),
    }
    assert_eq!(controller.finalized_turns()[0].reply, "kept");
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_turn_and_refuses_new_ones() {
    let connector = Arc::new(ScriptedConnector::streaming(vec![
        chunk(&delta("Hello")),
        Step::Stall,
    ]));
    let store = Arc::new(MemoryStore::default());
    let (mut controller, _events) = controller_with(connector, store, test_settings());

    controller.submit("Hi").unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    controller.shutdown().await;

    assert!(controller.in_flight().is_none());
    assert!(!controller.input_enabled());
    assert_eq!(controller.submit("again"), Err(SubmitError::ShutDown));
}

#[tokio::test(start_paused = true)]
async fn dropping_the_controller_stops_publication() {
    let connector = Arc::new(ScriptedConnector::streaming(vec![
        chunk(&delta("a fairly long reply that takes a while")),
        Step::Stall,
    ]));
    let store = Arc::new(MemoryStore::default());
    let (mut controller, mut events) = controller_with(connector, store, test_settings());

    controller.submit("Hi").unwrap();
    tokio::time::sleep(Duration::from_millis(15)).await;
    drop(controller);
    tokio::task::yield_now().await;
    let seen = drain(&mut events).len();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let late = drain(&mut events);
    assert!(late.is_empty(), "{seen} events before drop, then {late:?}");
}

#[tokio::test(start_paused = true)]
async fn history_is_kept_ahead_of_new_turns() {
    let earlier = FinalizedTurn {
        turn_id: TurnId::new(),
        message_id: MessageId::streaming(),
        conversation_id: "conv-1".to_string(),
        user_content: "Earlier".to_string(),
        reply: "Reply".to_string(),
        outcome: TurnOutcome::Delivered,
        completed_at: chrono::Utc::now(),
    };
    let connector = Arc::new(ScriptedConnector::streaming(vec![chunk(&delta("new"))]));
    let store = Arc::new(MemoryStore::default());
    let (controller, _events) = controller_with(connector, store, test_settings());
    let mut controller = controller.with_history(vec![earlier.clone()]);

    controller.submit("Now").unwrap();
    controller.wait_idle().await;

    let finalized = controller.finalized_turns();
    assert_eq!(finalized.len(), 2);
    assert_eq!(finalized[0], earlier);
    assert_eq!(finalized[1].reply, "new");
}

#[tokio::test(start_paused = true)]
async fn reveal_stopping_early_fails_the_turn() {
    let connector = Arc::new(ScriptedConnector::streaming(vec![
        chunk(&delta("Hello")),
        Step::Delay(Duration::from_millis(50)),
        chunk(&delta(" world")),
        chunk(&complete_frame()),
    ]));
    let store = Arc::new(MemoryStore::default());
    let (mut controller, mut events) = controller_with(connector, store.clone(), test_settings());

    let turn_id = controller.submit("Hi").unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(controller.scheduler_registry().is_active(&turn_id));

    // Scheduler goes away while the turn itself is not cancelled
    controller.scheduler_registry().stop(&turn_id).await;
    controller.wait_idle().await;

    let events = drain(&mut events);
    assert_eq!(
        states(&events),
        vec![Submitted, Placeholder, Streaming, Failed, Complete]
    );
    let finalized = controller.finalized_turns();
    assert_eq!(finalized[0].reply, DEFAULT_TRANSPORT_ERROR_MESSAGE);
    assert_eq!(finalized[0].outcome, TurnOutcome::TransportFailure);
    assert!(controller.input_enabled());
    assert_eq!(store.saved().len(), 1);
}

struct DropFlagStream {
    inner: ScriptedChunkStream,
    dropped: Arc<AtomicBool>,
}

#[async_trait]
impl ChunkStream for DropFlagStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, StreamError> {
        self.inner.next_chunk().await
    }
}

impl Drop for DropFlagStream {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

struct DropFlagConnector {
    steps: Vec<Step>,
    dropped: Arc<AtomicBool>,
}

#[async_trait]
impl StreamConnector for DropFlagConnector {
    async fn connect(&self, _request: &ReplyRequest) -> Result<Box<dyn ChunkStream>, StreamError> {
        Ok(Box::new(DropFlagStream {
            inner: ScriptedChunkStream::new(self.steps.clone()),
            dropped: self.dropped.clone(),
        }))
    }
}

/// Notes whether the source was already released when the turn is saved
struct SourceReleasedStore {
    dropped: Arc<AtomicBool>,
    released_at_save: Mutex<Vec<bool>>,
}

#[async_trait]
impl MessageStore for SourceReleasedStore {
    async fn save_turn(&self, _turn: &FinalizedTurn) -> anyhow::Result<()> {
        let released = self.dropped.load(Ordering::SeqCst);
        self.released_at_save.lock().unwrap().push(released);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn source_is_released_before_the_turn_finishes() {
    let dropped = Arc::new(AtomicBool::new(false));
    let connector = Arc::new(DropFlagConnector {
        // Complete frame stops reading before the source reaches EOF
        steps: vec![
            chunk(&delta("Hi")),
            chunk(&complete_frame()),
            chunk(&delta("never read")),
        ],
        dropped: dropped.clone(),
    });
    let store = Arc::new(SourceReleasedStore {
        dropped: dropped.clone(),
        released_at_save: Mutex::new(Vec::new()),
    });
    let (mut controller, _events) =
        ConversationController::new("conv-1", connector, store.clone(), test_settings());

    controller.submit("Hello").unwrap();
    controller.wait_idle().await;

    assert_eq!(controller.finalized_turns()[0].reply, "Hi");
    assert_eq!(*store.released_at_save.lock().unwrap(), vec![true]);
}
