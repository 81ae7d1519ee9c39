//! # Inspex Voice - Live Voice Session Engine
//!
//! Drives one real-time voice conversation between a field inspector and a
//! remote generative model over a single duplex connection: microphone
//! audio goes up, synthesized speech comes down, inline action tags in the
//! assistant's text become host commands, and structured tool calls run the
//! inspection workflow locally.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Live Session                           │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Mic In     │→ │ FrameConvert │→ │  SendQueue   │──→ uplink │
//! │  │ (cpal/host)  │  │  (16 kHz)    │  │ (cap 60, FIFO)│          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │         ↑ mic gate                                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │ Turn State   │← │  Playback    │← │  Classifier  │←─ downlink│
//! │  │  Machine     │  │  Scheduler   │  │ (audio/text/ │           │
//! │  └──────────────┘  └──────────────┘  │  tool calls) │           │
//! │                    ┌──────────────┐  └──────┬───────┘           │
//! │   CommandEvent  ←──│ Tag Parser   │←────────┤                   │
//! │                    └──────────────┘  ┌──────▼───────┐           │
//! │   toolResponse  ←────────────────────│ Tool Dispatch│           │
//! │                                      └──────────────┘           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
#[cfg(feature = "device")]
pub mod device;
pub mod error;
pub mod inspection;
pub mod playback;
pub mod protocol;
pub mod send_queue;
pub mod session;
pub mod tags;
pub mod tools;
pub mod transport;
pub mod turn;

pub use audio::{AudioFrame, AudioFrameConverter, PlayableFrame, RawFrame, RawSamples};
pub use config::{BackendConfig, EquipmentContext, LiveConfig, UplinkMode};
#[cfg(feature = "device")]
pub use device::{MicCapture, SpeakerOutput};
pub use error::{VoiceError, VoiceResult};
pub use inspection::{
    register_inspection_tools, FilePhotoSource, FindingsStore, HttpInspectionBackend,
    InspectionBackend, InspectionResult, PhotoSource,
};
pub use playback::{HeldPlaybackSink, PlaybackScheduler, PlaybackSink, PlaybackTicket};
pub use protocol::{InboundMessage, OutboundMessage, Priority};
pub use send_queue::{SendQueue, SendQueueHandle};
pub use session::{
    ConnectionState, EngineEvent, LiveEngine, LiveSession, Session, SessionHandle, SessionSnapshot,
};
pub use tags::{CommandEvent, TagCommandParser, TagDispatchSet};
pub use tools::{LiveTool, ToolCallDispatcher, ToolCallRequest, ToolCallResult, ToolError};
pub use transport::{Connector, DuplexTransport, MemoryConnector, MemoryPeer, WebSocketConnector, WireFrame};
pub use turn::{TurnConfig, TurnEvent, TurnState, TurnStateMachine};
