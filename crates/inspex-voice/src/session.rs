//! Live session engine
//!
//! Owns one duplex connection and everything hanging off it. All session
//! state lives in a single task; the audio callback, the socket reader, the
//! send-queue writer, tool calls and playback completions only ever talk to
//! it through channels.
//!
//! ```text
//!   push_audio ──▶ ┌──────────────┐ ──▶ SendQueue ──▶ writer ──▶ socket
//!   send_image ──▶ │ session task │
//!   stop       ──▶ │  (TurnState, │ ◀── receive loop ◀──────────── socket
//!                  │  tags, tools,│ ◀── tool JoinSet
//!                  │  playback)   │ ◀── playback completions
//!                  └──────┬───────┘
//!                         ▼
//!                   EngineEvent stream
//! ```

use crate::audio::{AudioFrameConverter, RawFrame};
use crate::config::LiveConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{PlaybackCompletion, PlaybackScheduler, PlaybackSink};
use crate::protocol::{build_setup_message, InboundMessage, OutboundMessage};
use crate::send_queue::{Enqueued, SendQueueHandle, UplinkFailure};
use crate::tags::{CommandEvent, TagCommandParser};
use crate::tools::{ToolCallDispatcher, ToolCallRequest, ToolCallResult};
use crate::transport::{spawn_receive_loop, Connector, DuplexTransport, TransportEvent};
use crate::turn::{TurnConfig, TurnEvent, TurnState, TurnStateMachine};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Captured frames buffered between the audio callback and the session task
const CAPTURE_CHANNEL_DEPTH: usize = 32;

/// Lifecycle of the connection behind a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Live,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Live => "live",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

/// One connection attempt
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Correlation ids joined with `:`, or the attempt id when none were given
    pub key: String,
    pub attempt_id: Uuid,
    pub state: ConnectionState,
    pub setup_acknowledged: bool,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Session {
    fn new(correlation_ids: &[&str]) -> Self {
        let attempt_id = Uuid::new_v4();
        let ids: Vec<&str> = correlation_ids
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .collect();
        let key = if ids.is_empty() {
            attempt_id.to_string()
        } else {
            ids.join(":")
        };
        Self {
            key,
            attempt_id,
            state: ConnectionState::Idle,
            setup_acknowledged: false,
            created_at: Utc::now(),
            closed_at: None,
        }
    }
}

/// What the host application receives from a running session
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    SessionStateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Turn(TurnEvent),
    Command(CommandEvent),
    /// What the inspector said, as transcribed by the model
    UserTranscript(String),
    ToolStarted { id: String, name: String },
    ToolFinished { id: String, name: String, ok: bool },
    /// Assistant-style status line for a session-ending error
    Status(String),
}

/// Point-in-time view of a session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session: Session,
    pub turn_state: TurnState,
    pub mic_open: bool,
    pub pending_playback: usize,
    pub queued_messages: usize,
    pub running_tools: usize,
}

impl SessionSnapshot {
    /// The "running tool" sub-state shown by the UI.
    pub fn is_running_tool(&self) -> bool {
        self.running_tools > 0
    }
}

enum Control {
    Stop(oneshot::Sender<()>),
    SendImage {
        data: Vec<u8>,
        mime_type: String,
        note: Option<String>,
    },
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

/// Cheap handle to a running session. Clones share the same session.
#[derive(Clone)]
pub struct SessionHandle {
    control: mpsc::UnboundedSender<Control>,
    capture: mpsc::Sender<RawFrame>,
    mic_gate: Arc<AtomicBool>,
    session: watch::Receiver<Session>,
}

impl SessionHandle {
    /// Offer one captured buffer. Safe to call from an audio callback: it
    /// never blocks, and returns false when the frame was dropped (mic
    /// muted, session closed, or the session task is behind).
    pub fn push_audio(&self, frame: RawFrame) -> bool {
        if !self.mic_gate.load(Ordering::Acquire) {
            return false;
        }
        self.capture.try_send(frame).is_ok()
    }

    /// Whether captured audio is currently being uplinked.
    pub fn is_mic_open(&self) -> bool {
        self.mic_gate.load(Ordering::Acquire)
    }

    /// Send a photo to the model as a user turn.
    pub fn send_image(&self, data: Vec<u8>, mime_type: &str, note: Option<String>) -> VoiceResult<()> {
        self.control
            .send(Control::SendImage {
                data,
                mime_type: mime_type.to_string(),
                note,
            })
            .map_err(|_| VoiceError::SessionClosed)
    }

    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.control.send(Control::Snapshot(tx)).ok()?;
        rx.await.ok()
    }

    pub fn session(&self) -> Session {
        self.session.borrow().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.borrow().state
    }

    /// Tear the session down and wait until it is closed. Calling it again,
    /// or on a session that already closed itself, does nothing.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.control.send(Control::Stop(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Resolve once the session has reached `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.session.clone();
        let _ = rx.wait_for(|s| s.state == ConnectionState::Closed).await;
    }
}

/// A started session: the handle plus its event stream
pub struct LiveSession {
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
}

/// Starts and stops live sessions. At most one session is active; starting
/// a new one tears down the previous one first.
pub struct LiveEngine {
    config: LiveConfig,
    connector: Arc<dyn Connector>,
    tools: Arc<ToolCallDispatcher>,
    active: Option<SessionHandle>,
}

impl LiveEngine {
    pub fn new(config: LiveConfig, connector: Arc<dyn Connector>, tools: ToolCallDispatcher) -> Self {
        Self {
            config,
            connector,
            tools: Arc::new(tools),
            active: None,
        }
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    pub fn active(&self) -> Option<&SessionHandle> {
        self.active.as_ref()
    }

    /// Connect, complete the setup handshake and start the session task.
    ///
    /// Downlink audio goes to `sink`. Capture is only accepted once this
    /// returns, i.e. after the setup acknowledgment.
    pub async fn start(
        &mut self,
        correlation_ids: &[&str],
        sink: Box<dyn PlaybackSink>,
    ) -> VoiceResult<LiveSession> {
        self.stop().await;

        let mut session = Session::new(correlation_ids);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let set_state = |session: &mut Session, to: ConnectionState| {
            let from = session.state;
            session.state = to;
            let _ = events_tx.send(EngineEvent::SessionStateChanged { from, to });
        };

        set_state(&mut session, ConnectionState::Connecting);
        info!(session = %session.key, "🎙️ Starting live session");

        let setup = build_setup_message(&self.config, self.tools.declarations());
        let transport = match DuplexTransport::open(
            self.connector.as_ref(),
            &self.config.endpoint_url(),
            OutboundMessage::ControlSetup(Box::new(setup)),
            self.config.setup_timeout(),
        )
        .await
        {
            Ok(transport) => transport,
            Err(e) => {
                error!(session = %session.key, "❌ Session failed to start: {}", e);
                set_state(&mut session, ConnectionState::Closed);
                return Err(e);
            }
        };

        session.setup_acknowledged = true;
        set_state(&mut session, ConnectionState::Live);

        let (sink_half, source_half) = transport.into_split();
        let shutdown = Arc::new(AtomicBool::new(false));

        let queue = SendQueueHandle::new(self.config.send_queue_capacity);
        let (uplink_tx, uplink_rx) = mpsc::unbounded_channel();
        let writer = queue.spawn_writer(sink_half, self.config.uplink_mode, uplink_tx);

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let receiver = spawn_receive_loop(source_half, transport_tx, shutdown.clone());

        let (mut turn, turn_rx) = TurnStateMachine::new(TurnConfig {
            settle_delay: self.config.settle_delay(),
            mute_during_tool_calls: self.config.mute_during_tool_calls,
        });
        turn.mark_live();
        let mic_gate = turn.mic_gate();

        let (playback, completion_rx) = PlaybackScheduler::new(sink);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (capture_tx, capture_rx) = mpsc::channel(CAPTURE_CHANNEL_DEPTH);
        let (session_tx, session_rx) = watch::channel(session.clone());

        let task = SessionTask {
            session,
            session_tx,
            events: events_tx,
            turn,
            turn_rx,
            parser: TagCommandParser::new(),
            playback,
            completion_rx,
            converter: AudioFrameConverter::new(),
            queue,
            writer: Some(writer),
            uplink_rx,
            receiver,
            transport_rx,
            shutdown,
            tools: self.tools.clone(),
            running: JoinSet::new(),
            control_rx,
            capture_rx,
            stop_timeout: self.config.stop_timeout(),
        };
        tokio::spawn(task.run());

        let handle = SessionHandle {
            control: control_tx,
            capture: capture_tx,
            mic_gate,
            session: session_rx,
        };
        self.active = Some(handle.clone());

        Ok(LiveSession {
            handle,
            events: events_rx,
        })
    }

    /// Stop the active session, if any.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.active.take() {
            handle.stop().await;
        }
    }
}

struct SessionTask {
    session: Session,
    session_tx: watch::Sender<Session>,
    events: mpsc::UnboundedSender<EngineEvent>,

    turn: TurnStateMachine,
    turn_rx: mpsc::UnboundedReceiver<TurnEvent>,
    parser: TagCommandParser,
    playback: PlaybackScheduler,
    completion_rx: mpsc::UnboundedReceiver<PlaybackCompletion>,
    converter: AudioFrameConverter,

    queue: SendQueueHandle,
    writer: Option<JoinHandle<()>>,
    uplink_rx: mpsc::UnboundedReceiver<UplinkFailure>,
    receiver: JoinHandle<()>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    shutdown: Arc<AtomicBool>,

    tools: Arc<ToolCallDispatcher>,
    running: JoinSet<ToolCallResult>,

    control_rx: mpsc::UnboundedReceiver<Control>,
    capture_rx: mpsc::Receiver<RawFrame>,
    stop_timeout: std::time::Duration,
}

impl SessionTask {
    async fn run(mut self) {
        let failure = loop {
            let settle = self.turn.settle_deadline();

            tokio::select! {
                cmd = self.control_rx.recv() => match cmd {
                    Some(Control::Stop(ack)) => {
                        self.teardown().await;
                        let _ = ack.send(());
                        return;
                    }
                    Some(Control::SendImage { data, mime_type, note }) => {
                        info!(session = %self.session.key, bytes = data.len(), "🖼️ Sending image");
                        self.enqueue(OutboundMessage::ImageChunk { data, mime_type, note });
                    }
                    Some(Control::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    None => {
                        debug!(session = %self.session.key, "all handles dropped");
                        break None;
                    }
                },
                Some(event) = self.transport_rx.recv() => match event {
                    TransportEvent::Message(msg) => {
                        if let Err(e) = self.on_inbound(msg) {
                            break Some(e);
                        }
                    }
                    TransportEvent::Disconnected(reason) => {
                        break Some(VoiceError::UnexpectedDisconnect(reason));
                    }
                },
                Some(UplinkFailure(reason)) = self.uplink_rx.recv() => {
                    break Some(VoiceError::UnexpectedDisconnect(format!("send failed: {reason}")));
                }
                Some(joined) = self.running.join_next(), if !self.running.is_empty() => {
                    self.on_tool_finished(joined);
                }
                Some(completion) = self.completion_rx.recv() => {
                    if self.playback.on_completion(completion) {
                        self.turn.on_playback_drained(Instant::now());
                    }
                }
                Some(event) = self.turn_rx.recv() => {
                    let _ = self.events.send(EngineEvent::Turn(event));
                }
                Some(raw) = self.capture_rx.recv() => {
                    if let Err(e) = self.on_captured(raw) {
                        break Some(e);
                    }
                }
                _ = tokio::time::sleep_until(settle.unwrap_or_else(Instant::now)), if settle.is_some() => {
                    if self.turn.poll_settle(Instant::now()) {
                        debug!(session = %self.session.key, "settled, microphone reopened");
                    }
                }
            }
        };

        if let Some(e) = failure {
            error!(session = %self.session.key, "❌ Session ended: {}", e);
            let _ = self.events.send(EngineEvent::Status(e.user_message()));
        }
        self.teardown().await;
    }

    fn on_inbound(&mut self, msg: InboundMessage) -> VoiceResult<()> {
        match msg {
            InboundMessage::SetupComplete => {
                debug!("duplicate setup acknowledgment ignored");
            }
            InboundMessage::Audio(bytes) => match self.converter.decode(&bytes) {
                Ok(frame) => {
                    self.turn.on_model_output();
                    self.playback.schedule(frame);
                }
                Err(e) => debug!("skipping downlink audio: {}", e),
            },
            InboundMessage::TextDelta(text) => {
                self.turn.on_model_output();
                for command in self.parser.push(&text) {
                    if !matches!(command, CommandEvent::AssistantText(_)) {
                        info!(session = %self.session.key, "🏷️ Command: {:?}", command);
                    }
                    let _ = self.events.send(EngineEvent::Command(command));
                }
            }
            InboundMessage::InputTranscript(text) => {
                self.turn.on_input_transcript();
                let _ = self.events.send(EngineEvent::UserTranscript(text));
            }
            InboundMessage::ToolCall(calls) => {
                for call in calls {
                    self.start_tool(call);
                }
            }
            InboundMessage::TurnComplete => {
                self.parser.reset_turn();
                self.turn.on_turn_complete(self.playback.pending(), Instant::now());
            }
            InboundMessage::Interrupted => {
                self.playback.interrupt();
                self.parser.reset_turn();
                self.turn.on_interrupted();
            }
            InboundMessage::ServerError(message) => {
                return Err(VoiceError::UnexpectedDisconnect(format!("server error: {message}")));
            }
        }
        Ok(())
    }

    fn on_captured(&mut self, raw: RawFrame) -> VoiceResult<()> {
        if !self.turn.on_captured_frame() {
            return Ok(());
        }
        match self.converter.encode(raw) {
            Ok(frame) => {
                self.enqueue(OutboundMessage::AudioChunk(frame));
                Ok(())
            }
            Err(e) if e.is_terminal() => Err(e),
            Err(e) => {
                trace!("skipping captured frame: {}", e);
                Ok(())
            }
        }
    }

    fn start_tool(&mut self, request: ToolCallRequest) {
        info!(session = %self.session.key, tool = %request.name, id = %request.id, "🔧 Tool call received");
        self.turn.tool_started();
        let _ = self.events.send(EngineEvent::ToolStarted {
            id: request.id.clone(),
            name: request.name.clone(),
        });

        let tools = self.tools.clone();
        self.running.spawn(async move {
            let fallback = ToolCallResult::failure(&request, "Tool call failed: tool panicked");
            match AssertUnwindSafe(tools.dispatch(request)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => fallback,
            }
        });
    }

    fn on_tool_finished(&mut self, joined: Result<ToolCallResult, JoinError>) {
        self.turn.tool_finished();
        let result = match joined {
            Ok(result) => result,
            Err(e) => {
                debug!("tool task ended without a result: {}", e);
                return;
            }
        };

        if let Some(failure) = result.dispatch_error() {
            warn!(session = %self.session.key, id = %result.id, "{}", failure);
        }
        let _ = self.events.send(EngineEvent::ToolFinished {
            id: result.id.clone(),
            name: result.name.clone(),
            ok: !result.is_error(),
        });
        self.enqueue(OutboundMessage::ToolResponse(result));
    }

    fn enqueue(&self, msg: OutboundMessage) {
        match self.queue.enqueue(msg) {
            Ok(Enqueued::Queued) => {}
            Ok(Enqueued::EvictedAudio) => trace!("send queue full, oldest audio evicted"),
            Err(VoiceError::SessionClosed) => debug!("send queue closed, message dropped"),
            Err(e) => warn!(session = %self.session.key, "{}", e),
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session: self.session.clone(),
            turn_state: self.turn.state(),
            mic_open: self.turn.is_mic_open(),
            pending_playback: self.playback.pending(),
            queued_messages: self.queue.len(),
            running_tools: self.turn.tools_in_flight(),
        }
    }

    fn set_state(&mut self, to: ConnectionState) {
        let from = self.session.state;
        if from == to {
            return;
        }
        self.session.state = to;
        if to == ConnectionState::Closed {
            self.session.closed_at = Some(Utc::now());
        }
        self.session_tx.send_replace(self.session.clone());
        let _ = self.events.send(EngineEvent::SessionStateChanged { from, to });
    }

    /// Idempotent teardown. Order matters: the shutdown flag goes first so
    /// the receive loop treats the socket closing under it as expected.
    async fn teardown(&mut self) {
        if matches!(self.session.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        info!(session = %self.session.key, "👋 Closing live session");
        self.set_state(ConnectionState::Closing);
        self.shutdown.store(true, Ordering::Release);

        self.turn.close();
        self.capture_rx.close();

        self.queue.clear();
        if let Err(e) = self.queue.enqueue(OutboundMessage::ControlEndSession) {
            debug!("end-of-session message not sent: {}", e);
        }
        self.queue.close();
        if let Some(writer) = self.writer.take() {
            let abort = writer.abort_handle();
            if tokio::time::timeout(self.stop_timeout, writer).await.is_err() {
                warn!(session = %self.session.key, "writer did not drain in {:?}", self.stop_timeout);
                abort.abort();
            }
        }

        let discarded = self.running.len();
        self.running.abort_all();
        if discarded > 0 {
            debug!(discarded, "pending tool calls discarded");
        }
        self.playback.interrupt();
        self.receiver.abort();

        while let Ok(event) = self.turn_rx.try_recv() {
            let _ = self.events.send(EngineEvent::Turn(event));
        }
        self.set_state(ConnectionState::Closed);
    }
}
