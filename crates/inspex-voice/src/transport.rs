//! Duplex transport: one bidirectional message connection per session.
//!
//! The connection is split into a [`FrameSink`] (owned by the send-queue
//! writer) and a [`FrameSource`] (owned by the receive loop). A
//! [`Connector`] opens the pair; [`WebSocketConnector`] does it over
//! tokio-tungstenite, [`MemoryConnector`] does it over channels for tests
//! and local harnesses.

use crate::error::{VoiceError, VoiceResult};
use crate::protocol::{classify, InboundMessage, OutboundMessage};
use crate::config::UplinkMode;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// A single message on the connection
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Write half of a connection
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: WireFrame) -> VoiceResult<()>;
    async fn close(&mut self) -> VoiceResult<()>;
}

/// Read half of a connection. `None` means the peer closed cleanly.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Option<VoiceResult<WireFrame>>;
}

/// Opens connections to an endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> VoiceResult<(Box<dyn FrameSink>, Box<dyn FrameSource>)>;
}

/// What the receive loop reports to the session task
#[derive(Debug)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// Connection ended outside of an intentional teardown
    Disconnected(String),
}

/// A connection that has completed the setup handshake
pub struct DuplexTransport {
    sink: Box<dyn FrameSink>,
    source: Box<dyn FrameSource>,
}

impl DuplexTransport {
    /// Connect, send the setup descriptor, and wait for its acknowledgment.
    pub async fn open(
        connector: &dyn Connector,
        endpoint: &str,
        setup: OutboundMessage,
        setup_timeout: Duration,
    ) -> VoiceResult<Self> {
        let (mut sink, mut source) = connector
            .connect(endpoint)
            .await
            .map_err(|e| match e {
                VoiceError::ConnectFailed(_) => e,
                other => VoiceError::ConnectFailed(other.to_string()),
            })?;

        let frame = setup.encode(UplinkMode::Json)?;
        sink.send(frame)
            .await
            .map_err(|e| VoiceError::ConnectFailed(format!("sending setup: {e}")))?;
        debug!("📤 Setup descriptor sent, waiting for acknowledgment");

        let ack = tokio::time::timeout(setup_timeout, async {
            loop {
                match source.next_frame().await {
                    Some(Ok(frame)) => match classify(frame) {
                        Ok(msgs) if msgs.contains(&InboundMessage::SetupComplete) => return Ok(()),
                        Ok(msgs) => {
                            if let Some(InboundMessage::ServerError(m)) =
                                msgs.iter().find(|m| matches!(m, InboundMessage::ServerError(_)))
                            {
                                return Err(VoiceError::SetupRejected(m.clone()));
                            }
                            debug!("ignoring {} message(s) before setup acknowledgment", msgs.len());
                        }
                        Err(e) => warn!("malformed message during setup: {}", e),
                    },
                    Some(Err(e)) => {
                        return Err(VoiceError::SetupRejected(format!("transport error: {e}")))
                    }
                    None => {
                        return Err(VoiceError::SetupRejected(
                            "connection closed before setup acknowledgment".to_string(),
                        ))
                    }
                }
            }
        })
        .await;

        match ack {
            Ok(Ok(())) => {
                info!("✅ Session setup acknowledged");
                Ok(Self { sink, source })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VoiceError::SetupRejected(format!(
                "no acknowledgment within {}s",
                setup_timeout.as_secs_f32()
            ))),
        }
    }

    pub fn into_split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        (self.sink, self.source)
    }
}

/// Spawn the receive loop.
///
/// Frames are classified and forwarded in arrival order. Malformed frames
/// are logged and skipped. Once `shutdown` is set, transport errors and
/// closes are swallowed.
pub fn spawn_receive_loop(
    mut source: Box<dyn FrameSource>,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = source.next_frame().await;
            if shutdown.load(Ordering::Acquire) {
                debug!("receive loop stopping after teardown");
                return;
            }
            match next {
                Some(Ok(frame)) => match classify(frame) {
                    Ok(msgs) => {
                        for msg in msgs {
                            if events.send(TransportEvent::Message(msg)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("⚠️ Skipping inbound message: {}", e),
                },
                Some(Err(e)) => {
                    let _ = events.send(TransportEvent::Disconnected(e.to_string()));
                    return;
                }
                None => {
                    let _ = events.send(TransportEvent::Disconnected(
                        "connection closed by peer".to_string(),
                    ));
                    return;
                }
            }
        }
    })
}

// ── WebSocket ─────────────────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects over WebSocket (ws:// or wss://)
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &str) -> VoiceResult<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let redacted = endpoint.split('?').next().unwrap_or(endpoint);
        info!("🔌 Connecting to {}", redacted);

        let (stream, _response) = tokio_tungstenite::connect_async(endpoint)
            .await
            .map_err(|e| VoiceError::ConnectFailed(e.to_string()))?;
        let (sink, source) = stream.split();
        Ok((Box::new(WsSink { inner: sink }), Box::new(WsSource { inner: source })))
    }
}

struct WsSink {
    inner: SplitSink<WsStream, WsMessage>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: WireFrame) -> VoiceResult<()> {
        let msg = match frame {
            WireFrame::Text(t) => WsMessage::Text(t),
            WireFrame::Binary(b) => WsMessage::Binary(b),
        };
        self.inner.send(msg).await?;
        Ok(())
    }

    async fn close(&mut self) -> VoiceResult<()> {
        self.inner.close().await?;
        Ok(())
    }
}

struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<VoiceResult<WireFrame>> {
        loop {
            return match self.inner.next().await? {
                Ok(WsMessage::Text(t)) => Some(Ok(WireFrame::Text(t))),
                Ok(WsMessage::Binary(b)) => Some(Ok(WireFrame::Binary(b))),
                Ok(WsMessage::Close(frame)) => {
                    debug!("close frame received: {:?}", frame);
                    None
                }
                // Ping/pong are answered by tungstenite
                Ok(_) => continue,
                Err(e) => Some(Err(e.into())),
            };
        }
    }
}

// ── In-memory ─────────────────────────────────────────────────────

/// Connector backed by in-process channels.
///
/// Every successful `connect` hands the server side of the connection to
/// the receiver returned from [`MemoryConnector::new`].
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refuse: AtomicBool,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                refuse: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Make subsequent connects fail as if the endpoint were unreachable.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::Release);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &str) -> VoiceResult<(Box<dyn FrameSink>, Box<dyn FrameSource>)> {
        if self.refuse.load(Ordering::Acquire) {
            return Err(VoiceError::ConnectFailed(format!("{endpoint}: connection refused")));
        }

        let (up_tx, up_rx) = mpsc::unbounded_channel();
        let (down_tx, down_rx) = mpsc::unbounded_channel();
        let broken = Arc::new(AtomicBool::new(false));

        let peer = MemoryPeer {
            from_client: up_rx,
            to_client: Some(down_tx),
            uplink_broken: broken.clone(),
        };
        self.peers
            .send(peer)
            .map_err(|_| VoiceError::ConnectFailed("no memory listener".to_string()))?;

        Ok((
            Box::new(MemorySink { tx: Some(up_tx), broken }),
            Box::new(MemorySource { rx: down_rx }),
        ))
    }
}

/// Server side of an in-memory connection
pub struct MemoryPeer {
    from_client: mpsc::UnboundedReceiver<WireFrame>,
    to_client: Option<mpsc::UnboundedSender<VoiceResult<WireFrame>>>,
    uplink_broken: Arc<AtomicBool>,
}

impl MemoryPeer {
    pub fn send(&self, frame: WireFrame) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Ok(frame));
        }
    }

    pub fn send_json(&self, value: serde_json::Value) {
        self.send(WireFrame::Text(value.to_string()));
    }

    /// Deliver a transport error to the client's receive loop.
    pub fn fail(&self, reason: &str) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(Err(VoiceError::UnexpectedDisconnect(reason.to_string())));
        }
    }

    /// Close the downlink; the client sees a clean end of stream.
    pub fn hang_up(&mut self) {
        self.to_client = None;
    }

    /// Make every further client send fail.
    pub fn break_uplink(&self) {
        self.uplink_broken.store(true, Ordering::Release);
    }

    /// Next frame from the client, `None` once the client closed its sink.
    pub async fn recv(&mut self) -> Option<WireFrame> {
        self.from_client.recv().await
    }

    /// Next text frame from the client parsed as JSON, skipping binary frames.
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        loop {
            match self.from_client.recv().await? {
                WireFrame::Text(t) => return serde_json::from_str(&t).ok(),
                WireFrame::Binary(_) => continue,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<WireFrame> {
        self.from_client.try_recv().ok()
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<WireFrame>>,
    broken: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: WireFrame) -> VoiceResult<()> {
        if self.broken.load(Ordering::Acquire) {
            return Err(VoiceError::UnexpectedDisconnect("uplink broken".to_string()));
        }
        match &self.tx {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| VoiceError::UnexpectedDisconnect("peer gone".to_string())),
            None => Err(VoiceError::SessionClosed),
        }
    }

    async fn close(&mut self) -> VoiceResult<()> {
        self.tx = None;
        Ok(())
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<VoiceResult<WireFrame>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_frame(&mut self) -> Option<VoiceResult<WireFrame>> {
        self.rx.recv().await
    }
}
