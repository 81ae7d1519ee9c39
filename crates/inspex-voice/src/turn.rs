//! Turn-taking for a live duplex conversation
//!
//! Tracks who holds the floor and decides when the microphone is open. The
//! microphone is muted for the whole time the model is speaking, and only
//! reopens once playback has drained and a short settle delay has passed.
//! An interruption skips the settle delay and reopens it immediately.
//!
//! ```text
//!  Idle ──frame──▶ UserSpeaking ──transcript──▶ AwaitingModel
//!    ▲                  │                             │
//!    │                  └──────model audio/text───────┤
//!    │                                                ▼
//!    └──turnComplete + drained + settle──────── ModelSpeaking
//!
//!  any ──interrupted──▶ Interrupted ──▶ Idle
//! ```

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Conversational turn state. Exactly one is active per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    UserSpeaking,
    AwaitingModel,
    ModelSpeaking,
    Interrupted,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::UserSpeaking => "user_speaking",
            TurnState::AwaitingModel => "awaiting_model",
            TurnState::ModelSpeaking => "model_speaking",
            TurnState::Interrupted => "interrupted",
        }
    }
}

/// Events emitted by the turn state machine
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    StateChanged {
        from: TurnState,
        to: TurnState,
        timestamp: DateTime<Utc>,
    },

    /// Microphone frames are being uplinked again
    MicrophoneOpened,

    /// Microphone frames are captured but dropped
    MicrophoneMuted,

    /// The model finished its turn
    TurnCompleted { timestamp: DateTime<Utc> },

    /// The model was cut off
    Interruption { timestamp: DateTime<Utc> },
}

/// Configuration for turn handling
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Pause after playback drains before the mic reopens (default: 900ms)
    pub settle_delay: Duration,

    /// Keep the mic muted while a tool call is outstanding (default: true)
    pub mute_during_tool_calls: bool,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(900),
            mute_during_tool_calls: true,
        }
    }
}

/// Turn state plus the microphone gate derived from it.
///
/// Only the session task mutates this; the capture side reads the gate
/// through [`TurnStateMachine::mic_gate`].
pub struct TurnStateMachine {
    config: TurnConfig,
    state: TurnState,
    live: bool,
    closed: bool,

    // turnComplete seen while buffers were still playing
    completion_pending: bool,
    settle_deadline: Option<Instant>,
    tools_in_flight: usize,

    mic_open: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<TurnEvent>,
}

impl TurnStateMachine {
    pub fn new(config: TurnConfig) -> (Self, mpsc::UnboundedReceiver<TurnEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let machine = Self {
            config,
            state: TurnState::Idle,
            live: false,
            closed: false,
            completion_pending: false,
            settle_deadline: None,
            tools_in_flight: 0,
            mic_open: Arc::new(AtomicBool::new(false)),
            event_tx,
        };

        (machine, event_rx)
    }

    /// The session was acknowledged; capture may begin.
    pub fn mark_live(&mut self) {
        self.live = true;
        self.refresh_mic();
    }

    /// A captured frame arrived. Returns whether it should be uplinked.
    pub fn on_captured_frame(&mut self) -> bool {
        if !self.mic_open.load(Ordering::Acquire) {
            trace!(state = self.state.as_str(), "dropping captured frame");
            return false;
        }
        if self.state == TurnState::Idle {
            self.transition(TurnState::UserSpeaking);
        }
        true
    }

    /// The inspector's speech was transcribed, so the model has the floor next.
    pub fn on_input_transcript(&mut self) {
        if self.state == TurnState::UserSpeaking {
            self.transition(TurnState::AwaitingModel);
        }
    }

    /// Model audio or text arrived for the current turn.
    pub fn on_model_output(&mut self) {
        if self.closed {
            return;
        }
        if self.state != TurnState::ModelSpeaking {
            info!("🔇 Model speaking, microphone muted");
            self.transition(TurnState::ModelSpeaking);
        } else if self.completion_pending || self.settle_deadline.is_some() {
            // more output after turnComplete: a new model turn has started
            self.completion_pending = false;
            self.settle_deadline = None;
        }
    }

    /// `turnComplete` arrived. `pending_playback` is the number of buffers
    /// still scheduled on the output device.
    pub fn on_turn_complete(&mut self, pending_playback: usize, now: Instant) {
        self.emit_event(TurnEvent::TurnCompleted {
            timestamp: Utc::now(),
        });

        match self.state {
            TurnState::ModelSpeaking if pending_playback > 0 => {
                debug!(pending_playback, "turn complete, waiting for playback to drain");
                self.completion_pending = true;
            }
            TurnState::ModelSpeaking => {
                self.settle_deadline = Some(now + self.config.settle_delay);
            }
            TurnState::Idle => {}
            _ => self.transition(TurnState::Idle),
        }
    }

    /// The last scheduled buffer finished playing.
    pub fn on_playback_drained(&mut self, now: Instant) {
        if self.completion_pending {
            self.completion_pending = false;
            self.settle_deadline = Some(now + self.config.settle_delay);
            debug!("playback drained, settling for {:?}", self.config.settle_delay);
        }
    }

    /// When the settle timer should fire, if one is armed.
    pub fn settle_deadline(&self) -> Option<Instant> {
        self.settle_deadline
    }

    /// Fire the settle timer if its deadline has passed.
    pub fn poll_settle(&mut self, now: Instant) -> bool {
        match self.settle_deadline {
            Some(deadline) if deadline <= now => {
                self.settle_deadline = None;
                self.transition(TurnState::Idle);
                true
            }
            _ => false,
        }
    }

    /// The model was interrupted. Playback must already have been flushed.
    pub fn on_interrupted(&mut self) {
        info!("⚡ Interrupted, reopening microphone");
        self.emit_event(TurnEvent::Interruption {
            timestamp: Utc::now(),
        });
        self.completion_pending = false;
        self.settle_deadline = None;
        self.transition(TurnState::Interrupted);
        self.transition(TurnState::Idle);
    }

    pub fn tool_started(&mut self) {
        self.tools_in_flight += 1;
        if self.state == TurnState::UserSpeaking {
            self.transition(TurnState::AwaitingModel);
        } else {
            self.refresh_mic();
        }
    }

    pub fn tool_finished(&mut self) {
        self.tools_in_flight = self.tools_in_flight.saturating_sub(1);
        self.refresh_mic();
    }

    pub fn tools_in_flight(&self) -> usize {
        self.tools_in_flight
    }

    /// Session is going away: mute for good and disarm the settle timer.
    pub fn close(&mut self) {
        self.closed = true;
        self.settle_deadline = None;
        self.completion_pending = false;
        self.tools_in_flight = 0;
        if self.state != TurnState::Idle {
            self.transition(TurnState::Idle);
        } else {
            self.refresh_mic();
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn is_mic_open(&self) -> bool {
        self.mic_open.load(Ordering::Acquire)
    }

    /// Shared flag the capture side checks before doing any work.
    pub fn mic_gate(&self) -> Arc<AtomicBool> {
        self.mic_open.clone()
    }

    fn transition(&mut self, to: TurnState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        debug!("turn {} -> {}", from.as_str(), to.as_str());
        self.emit_event(TurnEvent::StateChanged {
            from,
            to,
            timestamp: Utc::now(),
        });
        self.refresh_mic();
    }

    fn refresh_mic(&mut self) {
        let muted_for_tool = self.config.mute_during_tool_calls && self.tools_in_flight > 0;
        let open = self.live
            && !self.closed
            && !muted_for_tool
            && !matches!(self.state, TurnState::ModelSpeaking | TurnState::Interrupted);

        let was_open = self.mic_open.swap(open, Ordering::AcqRel);
        if was_open != open {
            self.emit_event(if open {
                TurnEvent::MicrophoneOpened
            } else {
                TurnEvent::MicrophoneMuted
            });
        }
    }

    fn emit_event(&self, event: TurnEvent) {
        if self.event_tx.send(event).is_err() {
            trace!("turn event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> (TurnStateMachine, mpsc::UnboundedReceiver<TurnEvent>) {
        let (mut m, rx) = TurnStateMachine::new(TurnConfig {
            settle_delay: Duration::from_millis(900),
            mute_during_tool_calls: true,
        });
        m.mark_live();
        (m, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[test]
    fn test_mic_closed_before_live() {
        let (mut m, _rx) = TurnStateMachine::new(TurnConfig::default());
        assert!(!m.on_captured_frame());
        assert_eq!(m.state(), TurnState::Idle);
        m.mark_live();
        assert!(m.on_captured_frame());
        assert_eq!(m.state(), TurnState::UserSpeaking);
    }

    #[test]
    fn test_model_output_mutes_mic() {
        let (mut m, mut rx) = machine();
        m.on_captured_frame();
        m.on_input_transcript();
        assert_eq!(m.state(), TurnState::AwaitingModel);
        assert!(m.on_captured_frame(), "audio keeps flowing while awaiting the model");

        m.on_model_output();
        assert_eq!(m.state(), TurnState::ModelSpeaking);
        assert!(!m.is_mic_open());
        assert!(!m.on_captured_frame());
        assert!(drain(&mut rx).contains(&TurnEvent::MicrophoneMuted));
    }

    #[test]
    fn test_turn_complete_waits_for_drain_then_settle() {
        let (mut m, _rx) = machine();
        let t0 = Instant::now();
        m.on_model_output();
        m.on_turn_complete(3, t0);
        assert_eq!(m.state(), TurnState::ModelSpeaking);
        assert_eq!(m.settle_deadline(), None);

        let drained_at = t0 + Duration::from_millis(400);
        m.on_playback_drained(drained_at);
        assert_eq!(m.settle_deadline(), Some(drained_at + Duration::from_millis(900)));

        assert!(!m.poll_settle(drained_at + Duration::from_millis(899)));
        assert!(!m.is_mic_open());
        assert!(m.poll_settle(drained_at + Duration::from_millis(900)));
        assert_eq!(m.state(), TurnState::Idle);
        assert!(m.is_mic_open());
    }

    #[test]
    fn test_turn_complete_with_nothing_playing_settles_immediately() {
        let (mut m, _rx) = machine();
        let t0 = Instant::now();
        m.on_model_output();
        m.on_turn_complete(0, t0);
        assert_eq!(m.settle_deadline(), Some(t0 + Duration::from_millis(900)));
    }

    #[test]
    fn test_interrupt_bypasses_settle() {
        let (mut m, mut rx) = machine();
        let t0 = Instant::now();
        m.on_model_output();
        m.on_turn_complete(0, t0);
        assert!(m.settle_deadline().is_some());

        m.on_interrupted();
        assert_eq!(m.state(), TurnState::Idle);
        assert_eq!(m.settle_deadline(), None);
        assert!(m.is_mic_open());

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            TurnEvent::StateChanged { to: TurnState::Interrupted, .. }
        )));
    }

    #[test]
    fn test_tool_calls_mute_until_answered() {
        let (mut m, _rx) = machine();
        m.on_captured_frame();
        m.tool_started();
        m.tool_started();
        assert_eq!(m.state(), TurnState::AwaitingModel);
        assert!(!m.on_captured_frame());
        m.tool_finished();
        assert!(!m.is_mic_open());
        m.tool_finished();
        assert!(m.is_mic_open());
    }

    #[test]
    fn test_tool_mute_is_configurable() {
        let (mut m, _rx) = TurnStateMachine::new(TurnConfig {
            mute_during_tool_calls: false,
            ..Default::default()
        });
        m.mark_live();
        m.tool_started();
        assert!(m.on_captured_frame());
    }

    #[test]
    fn test_close_mutes_and_disarms() {
        let (mut m, _rx) = machine();
        m.on_model_output();
        m.on_turn_complete(0, Instant::now());
        m.close();
        assert_eq!(m.settle_deadline(), None);
        assert!(!m.is_mic_open());
        assert!(!m.on_captured_frame());
    }
}
