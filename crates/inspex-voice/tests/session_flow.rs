//! End-to-end session tests over the in-memory transport.

use async_trait::async_trait;
use base64::Engine;
use inspex_voice::{
    CommandEvent, ConnectionState, EngineEvent, HeldPlaybackSink, LiveConfig, LiveEngine,
    LiveSession, LiveTool, MemoryConnector, MemoryPeer, PlayableFrame, PlaybackSink,
    PlaybackTicket, RawFrame, ToolCallDispatcher, ToolError, TurnEvent, TurnState, VoiceError,
    VoiceResult, WireFrame,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_config() -> LiveConfig {
    LiveConfig {
        endpoint: "mem://live".to_string(),
        settle_delay_ms: 20,
        setup_timeout_secs: 1,
        stop_timeout_ms: 500,
        ..Default::default()
    }
}

/// Completes every frame the moment it is scheduled.
struct InstantSink;

impl PlaybackSink for InstantSink {
    fn play(&mut self, _frame: PlayableFrame, _ticket: PlaybackTicket) -> VoiceResult<()> {
        Ok(())
    }

    fn flush(&mut self) {}
}

struct BrokenCamera;

#[async_trait]
impl LiveTool for BrokenCamera {
    fn name(&self) -> &str {
        "run_inspection"
    }
    fn description(&self) -> &str {
        "Always fails"
    }
    fn parameters(&self) -> Value {
        json!({"type": "OBJECT", "properties": {}})
    }
    async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
        Err(ToolError::Backend("camera offline".to_string()))
    }
}

/// Blocks until released.
struct Gate(Arc<Notify>);

#[async_trait]
impl LiveTool for Gate {
    fn name(&self) -> &str {
        "order_parts"
    }
    fn description(&self) -> &str {
        "Waits for the test"
    }
    fn parameters(&self) -> Value {
        json!({"type": "OBJECT", "properties": {}})
    }
    async fn execute(&self, _args: Value) -> Result<Value, ToolError> {
        self.0.notified().await;
        Ok(json!({"status": "ordered"}))
    }
}

struct Harness {
    engine: LiveEngine,
    session: LiveSession,
    peer: MemoryPeer,
    setup: Value,
    seen: Vec<EngineEvent>,
}

impl Harness {
    async fn start(tools: ToolCallDispatcher, sink: Box<dyn PlaybackSink>) -> Self {
        init_logging();
        let (connector, mut peers) = MemoryConnector::new();
        let mut engine = LiveEngine::new(test_config(), Arc::new(connector), tools);

        let server = tokio::spawn(async move {
            let mut peer = peers.recv().await.unwrap();
            let setup = peer.recv_json().await.unwrap();
            peer.send_json(json!({"setupComplete": {}}));
            (peer, setup)
        });

        let session = timeout(WAIT, engine.start(&["task-1", "insp-5"], sink))
            .await
            .unwrap()
            .unwrap();
        let (peer, setup) = server.await.unwrap();
        Self {
            engine,
            session,
            peer,
            setup,
            seen: Vec::new(),
        }
    }

    async fn wait_for(&mut self, mut pred: impl FnMut(&EngineEvent) -> bool) -> EngineEvent {
        loop {
            let event = timeout(WAIT, self.session.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event stream ended");
            self.seen.push(event.clone());
            if pred(&event) {
                return event;
            }
        }
    }

    /// Collect events until the session drops its sender.
    async fn drain_events(&mut self) {
        while let Ok(Some(event)) = timeout(WAIT, self.session.events.recv()).await {
            self.seen.push(event);
        }
    }

    /// Next uplink JSON message carrying `key`.
    async fn uplink_with(&mut self, key: &str) -> Value {
        loop {
            let msg = timeout(WAIT, self.peer.recv_json())
                .await
                .expect("timed out waiting for uplink")
                .expect("uplink closed");
            if msg.get(key).is_some() {
                return msg;
            }
        }
    }

    async fn remaining_uplink(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(Some(msg)) = timeout(WAIT, self.peer.recv_json()).await {
            out.push(msg);
        }
        out
    }
}

fn pcm_chunk(samples: usize) -> Vec<u8> {
    vec![0x10; samples * 2]
}

#[tokio::test]
async fn test_handshake_goes_live() {
    let mut h = Harness::start(ToolCallDispatcher::new(2000), Box::new(InstantSink)).await;

    assert_eq!(
        h.setup["setup"]["model"],
        "models/gemini-2.5-flash-native-audio-preview-12-2025"
    );
    let handle = h.session.handle.clone();
    assert_eq!(handle.connection_state(), ConnectionState::Live);
    assert!(handle.session().setup_acknowledged);
    assert_eq!(handle.session().key, "task-1:insp-5");

    h.wait_for(|e| {
        matches!(
            e,
            EngineEvent::SessionStateChanged {
                to: ConnectionState::Live,
                ..
            }
        )
    })
    .await;

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.turn_state, TurnState::Idle);
    assert!(snapshot.mic_open);
    assert_eq!(snapshot.pending_playback, 0);

    h.engine.stop().await;
}

#[tokio::test]
async fn test_captured_audio_is_uplinked() {
    let mut h = Harness::start(ToolCallDispatcher::new(2000), Box::new(InstantSink)).await;

    assert!(h.session.handle.push_audio(RawFrame::i16(vec![256; 320], 16_000)));
    let msg = h.uplink_with("realtimeInput").await;
    let chunk = &msg["realtimeInput"]["mediaChunks"][0];
    assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(chunk["data"].as_str().unwrap())
        .unwrap();
    assert_eq!(bytes.len(), 640);

    h.wait_for(|e| {
        matches!(
            e,
            EngineEvent::Turn(TurnEvent::StateChanged {
                to: TurnState::UserSpeaking,
                ..
            })
        )
    })
    .await;
    h.session.handle.stop().await;
}

#[tokio::test]
async fn test_capture_photo_tag_is_fully_consumed() {
    let mut h = Harness::start(ToolCallDispatcher::new(2000), Box::new(InstantSink)).await;

    h.peer.send_json(json!({
        "serverContent": {"modelTurn": {"parts": [{"text": "[capture_photo: rust on bracket]"}]}}
    }));
    h.peer.send_json(json!({"serverContent": {"turnComplete": true}}));
    h.wait_for(|e| matches!(e, EngineEvent::Turn(TurnEvent::TurnCompleted { .. })))
        .await;

    let photos = h
        .seen
        .iter()
        .filter(|e| {
            **e == EngineEvent::Command(CommandEvent::CapturePhotoWithContext(
                "rust on bracket".to_string(),
            ))
        })
        .count();
    let texts = h
        .seen
        .iter()
        .filter(|e| matches!(e, EngineEvent::Command(CommandEvent::AssistantText(_))))
        .count();
    assert_eq!(photos, 1);
    assert_eq!(texts, 0);

    h.engine.stop().await;
}

#[tokio::test]
async fn test_submit_task_fires_again_next_turn() {
    let mut h = Harness::start(ToolCallDispatcher::new(2000), Box::new(InstantSink)).await;

    for chunk in ["Saving [sub", "mit_task] now", " [submit_task]"] {
        h.peer.send_json(json!({"serverContent": {"outputTranscription": {"text": chunk}}}));
    }
    h.peer.send_json(json!({"type": "turn_complete"}));
    h.peer.send_json(json!({"type": "transcript", "role": "assistant", "text": "[SUBMIT_TASK]"}));
    h.peer.send_json(json!({"type": "turn_complete"}));

    let mut completed = 0;
    h.wait_for(|e| {
        if matches!(e, EngineEvent::Turn(TurnEvent::TurnCompleted { .. })) {
            completed += 1;
        }
        completed == 2
    })
    .await;
    let submits = h
        .seen
        .iter()
        .filter(|e| **e == EngineEvent::Command(CommandEvent::SubmitTask))
        .count();
    assert_eq!(submits, 2);

    h.engine.stop().await;
}

#[tokio::test]
async fn test_failed_tool_is_answered_exactly_once() {
    let mut tools = ToolCallDispatcher::new(2000);
    tools.register(Arc::new(BrokenCamera));
    let mut h = Harness::start(tools, Box::new(InstantSink)).await;

    h.peer.send_json(json!({
        "toolCall": {"functionCalls": [{"id": "x", "name": "run_inspection", "args": {"voice_text": "rim"}}]}
    }));

    let response = h.uplink_with("toolResponse").await;
    let answer = &response["toolResponse"]["functionResponses"][0];
    assert_eq!(answer["id"], "x");
    assert!(!answer["response"]["error"].as_str().unwrap().is_empty());

    h.wait_for(|e| matches!(e, EngineEvent::ToolFinished { ok: false, .. }))
        .await;

    h.session.handle.stop().await;
    let rest = h.remaining_uplink().await;
    assert!(rest.iter().all(|m| m.get("toolResponse").is_none()));
    assert_eq!(rest.last().unwrap()["type"], "end_session");
}

#[tokio::test]
async fn test_mic_muted_while_tool_runs() {
    let release = Arc::new(Notify::new());
    let mut tools = ToolCallDispatcher::new(2000);
    tools.register(Arc::new(Gate(release.clone())));
    let mut h = Harness::start(tools, Box::new(InstantSink)).await;
    let handle = h.session.handle.clone();

    h.peer.send_json(json!({"type": "tool_call", "function_calls": [{"id": "t1", "name": "order_parts", "args": {}}]}));
    h.wait_for(|e| matches!(e, EngineEvent::ToolStarted { .. })).await;

    assert!(!handle.is_mic_open());
    assert!(!handle.push_audio(RawFrame::i16(vec![1; 320], 16_000)));
    assert!(handle.snapshot().await.unwrap().is_running_tool());

    release.notify_one();
    h.wait_for(|e| matches!(e, EngineEvent::ToolFinished { ok: true, .. }))
        .await;
    assert!(handle.is_mic_open());
    assert_eq!(handle.snapshot().await.unwrap().running_tools, 0);

    let response = h.uplink_with("toolResponse").await;
    assert_eq!(response["toolResponse"]["functionResponses"][0]["response"]["status"], "ordered");
    h.engine.stop().await;
}

#[tokio::test]
async fn test_interrupt_flushes_playback_and_reopens_mic() {
    let mut h = Harness::start(ToolCallDispatcher::new(2000), Box::new(HeldPlaybackSink::new())).await;
    let handle = h.session.handle.clone();

    for _ in 0..3 {
        h.peer.send(WireFrame::Binary(pcm_chunk(480)));
    }
    timeout(WAIT, async {
        while handle.snapshot().await.unwrap().pending_playback < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(!handle.is_mic_open());

    h.peer.send_json(json!({"serverContent": {"interrupted": true}}));
    h.wait_for(|e| matches!(e, EngineEvent::Turn(TurnEvent::Interruption { .. })))
        .await;

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.pending_playback, 0);
    assert_eq!(snapshot.turn_state, TurnState::Idle);
    assert!(snapshot.mic_open);

    h.engine.stop().await;
}

#[tokio::test]
async fn test_turn_complete_settles_before_reopening_mic() {
    let mut h = Harness::start(ToolCallDispatcher::new(2000), Box::new(InstantSink)).await;
    let handle = h.session.handle.clone();

    h.peer.send(WireFrame::Binary(pcm_chunk(240)));
    h.wait_for(|e| {
        matches!(
            e,
            EngineEvent::Turn(TurnEvent::StateChanged {
                to: TurnState::ModelSpeaking,
                ..
            })
        )
    })
    .await;
    assert!(!handle.is_mic_open());

    h.peer.send_json(json!({"serverContent": {"turnComplete": true}}));
    h.wait_for(|e| {
        matches!(
            e,
            EngineEvent::Turn(TurnEvent::StateChanged {
                from: TurnState::ModelSpeaking,
                to: TurnState::Idle,
                ..
            })
        )
    })
    .await;
    assert!(handle.is_mic_open());

    h.engine.stop().await;
}

#[tokio::test]
async fn test_turn_complete_waits_for_playback_drain_then_settles() {
    let held = HeldPlaybackSink::new();
    let mut h = Harness::start(ToolCallDispatcher::new(2000), Box::new(held.clone())).await;
    let handle = h.session.handle.clone();
    let settle = Duration::from_millis(test_config().settle_delay_ms);

    h.peer.send(WireFrame::Binary(pcm_chunk(480)));
    h.peer.send(WireFrame::Binary(pcm_chunk(480)));
    timeout(WAIT, async {
        while handle.snapshot().await.unwrap().pending_playback < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(held.held(), 2);

    h.peer.send_json(json!({"serverContent": {"turnComplete": true}}));
    h.wait_for(|e| matches!(e, EngineEvent::Turn(TurnEvent::TurnCompleted { .. })))
        .await;

    // well past the settle delay, but nothing has finished playing yet
    tokio::time::sleep(settle * 3).await;
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.turn_state, TurnState::ModelSpeaking);
    assert_eq!(snapshot.pending_playback, 2);
    assert!(!snapshot.mic_open);
    assert!(!handle.is_mic_open());

    let drained_at = tokio::time::Instant::now();
    held.finish_all();
    assert!(!handle.is_mic_open());

    h.wait_for(|e| {
        matches!(
            e,
            EngineEvent::Turn(TurnEvent::StateChanged {
                from: TurnState::ModelSpeaking,
                to: TurnState::Idle,
                ..
            })
        )
    })
    .await;
    assert!(drained_at.elapsed() >= settle);
    assert!(handle.is_mic_open());
    assert_eq!(handle.snapshot().await.unwrap().pending_playback, 0);

    h.engine.stop().await;
}

#[tokio::test]
async fn test_image_goes_out_as_client_content() {
    let mut h = Harness::start(ToolCallDispatcher::new(2000), Box::new(InstantSink)).await;

    h.session
        .handle
        .send_image(vec![0xFF, 0xD8, 0xFF, 0xD9], "image/jpeg", Some("left track".to_string()))
        .unwrap();
    let msg = h.uplink_with("clientContent").await;
    let parts = &msg["clientContent"]["turns"][0]["parts"];
    assert_eq!(parts[0]["inlineData"]["mimeType"], "image/jpeg");
    assert_eq!(parts[1]["text"], "left track");

    h.engine.stop().await;
}

#[tokio::test]
async fn test_stop_is_idempotent_and_sends_end_session() {
    let mut h = Harness::start(ToolCallDispatcher::new(2000), Box::new(InstantSink)).await;
    let handle = h.session.handle.clone();

    handle.stop().await;
    handle.stop().await;
    h.engine.stop().await;
    assert_eq!(handle.connection_state(), ConnectionState::Closed);
    assert!(handle.session().closed_at.is_some());
    assert!(!handle.push_audio(RawFrame::i16(vec![1; 320], 16_000)));
    assert!(matches!(
        handle.send_image(vec![1], "image/jpeg", None),
        Err(VoiceError::SessionClosed)
    ));

    let uplink = h.remaining_uplink().await;
    let ends = uplink.iter().filter(|m| m["type"] == "end_session").count();
    assert_eq!(ends, 1);

    h.drain_events().await;
    let closed = h
        .seen
        .iter()
        .filter(|e| {
            matches!(
                e,
                EngineEvent::SessionStateChanged {
                    to: ConnectionState::Closed,
                    ..
                }
            )
        })
        .count();
    assert_eq!(closed, 1);
    assert!(!h.seen.iter().any(|e| matches!(e, EngineEvent::Status(_))));
}

#[tokio::test]
async fn test_unexpected_disconnect_surfaces_once() {
    let mut h = Harness::start(ToolCallDispatcher::new(2000), Box::new(InstantSink)).await;

    h.peer.fail("connection reset by peer");
    h.drain_events().await;

    let statuses: Vec<_> = h
        .seen
        .iter()
        .filter(|e| matches!(e, EngineEvent::Status(_)))
        .collect();
    assert_eq!(statuses.len(), 1);
    assert_eq!(h.session.handle.connection_state(), ConnectionState::Closed);

    // stopping after the session closed itself is a no-op
    h.session.handle.stop().await;
}

#[tokio::test]
async fn test_server_error_ends_session() {
    let mut h = Harness::start(ToolCallDispatcher::new(2000), Box::new(InstantSink)).await;

    h.peer.send_json(json!({"type": "error", "message": "quota exceeded"}));
    h.session.handle.closed().await;
    h.drain_events().await;
    assert_eq!(
        h.seen.iter().filter(|e| matches!(e, EngineEvent::Status(_))).count(),
        1
    );
}

#[tokio::test]
async fn test_setup_timeout_is_setup_rejected() {
    init_logging();
    let (connector, mut peers) = MemoryConnector::new();
    let mut engine = LiveEngine::new(test_config(), Arc::new(connector), ToolCallDispatcher::new(2000));

    let silent = tokio::spawn(async move {
        let mut peer = peers.recv().await.unwrap();
        // swallow the setup and never acknowledge it
        while peer.recv().await.is_some() {}
    });

    let err = engine.start(&[], Box::new(InstantSink)).await.err().unwrap();
    assert!(matches!(err, VoiceError::SetupRejected(_)));
    assert!(err.is_terminal());
    assert!(engine.active().is_none());
    silent.abort();
}

#[tokio::test]
async fn test_refused_connection_is_connect_failed() {
    init_logging();
    let (connector, _peers) = MemoryConnector::new();
    connector.refuse_connections(true);
    let mut engine = LiveEngine::new(test_config(), Arc::new(connector), ToolCallDispatcher::new(2000));

    let err = engine.start(&["task-1"], Box::new(InstantSink)).await.err().unwrap();
    assert!(matches!(err, VoiceError::ConnectFailed(_)));
    assert!(!err.user_message().is_empty());
}

#[tokio::test]
async fn test_new_session_replaces_previous() {
    init_logging();
    let (connector, mut peers) = MemoryConnector::new();
    let mut engine = LiveEngine::new(test_config(), Arc::new(connector), ToolCallDispatcher::new(2000));

    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(mut peer) = peers.recv().await {
            let _setup = peer.recv_json().await;
            peer.send_json(json!({"setupComplete": {}}));
            let _ = peer_tx.send(peer);
        }
    });

    let first = engine.start(&["task-1"], Box::new(InstantSink)).await.unwrap();
    let mut first_peer = peer_rx.recv().await.unwrap();
    let second = engine.start(&["task-2"], Box::new(InstantSink)).await.unwrap();
    let _second_peer = peer_rx.recv().await.unwrap();

    assert_eq!(first.handle.connection_state(), ConnectionState::Closed);
    assert_eq!(second.handle.connection_state(), ConnectionState::Live);
    assert_eq!(engine.active().unwrap().session().key, "task-2");

    let mut saw_end = false;
    while let Ok(Some(msg)) = timeout(WAIT, first_peer.recv_json()).await {
        saw_end |= msg["type"] == "end_session";
    }
    assert!(saw_end);

    engine.stop().await;
}
