//! Downlink playback bookkeeping
//!
//! Decoded frames are handed to a [`PlaybackSink`] together with a
//! [`PlaybackTicket`]. The sink drops the ticket when the frame has finished
//! playing (or was discarded), which reports completion back to the
//! session. An interruption bumps the epoch so completions from flushed
//! buffers are ignored.

use crate::audio::PlayableFrame;
use crate::error::VoiceResult;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Output side of the audio path (speaker, file, test recorder)
pub trait PlaybackSink: Send {
    /// Schedule a frame. Drop `ticket` once it has played.
    fn play(&mut self, frame: PlayableFrame, ticket: PlaybackTicket) -> VoiceResult<()>;

    /// Stop immediately and discard everything scheduled.
    fn flush(&mut self);
}

/// Completion report for one scheduled frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackCompletion {
    pub epoch: u64,
}

/// Reports completion of one frame when dropped
#[derive(Debug)]
pub struct PlaybackTicket {
    epoch: u64,
    tx: mpsc::UnboundedSender<PlaybackCompletion>,
}

impl PlaybackTicket {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for PlaybackTicket {
    fn drop(&mut self) {
        let _ = self.tx.send(PlaybackCompletion { epoch: self.epoch });
    }
}

pub struct PlaybackScheduler {
    sink: Box<dyn PlaybackSink>,
    scheduled: usize,
    epoch: u64,
    completion_tx: mpsc::UnboundedSender<PlaybackCompletion>,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn PlaybackSink>) -> (Self, mpsc::UnboundedReceiver<PlaybackCompletion>) {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        (
            Self {
                sink,
                scheduled: 0,
                epoch: 0,
                completion_tx,
            },
            completion_rx,
        )
    }

    /// Hand a frame to the sink and count it as pending.
    pub fn schedule(&mut self, frame: PlayableFrame) {
        self.scheduled += 1;
        let ticket = PlaybackTicket {
            epoch: self.epoch,
            tx: self.completion_tx.clone(),
        };
        let seq = frame.seq;
        if let Err(e) = self.sink.play(frame, ticket) {
            // the dropped ticket still reports completion
            warn!(seq, "⚠️ Playback failed: {}", e);
        }
    }

    /// Account for one completion. Returns true when this drained the
    /// last pending buffer.
    pub fn on_completion(&mut self, completion: PlaybackCompletion) -> bool {
        if completion.epoch != self.epoch {
            return false;
        }
        let previous = self.scheduled;
        self.scheduled = previous.saturating_sub(1);
        previous == 1
    }

    /// Flush the sink and forget everything scheduled so far.
    pub fn interrupt(&mut self) {
        self.epoch += 1;
        let dropped = std::mem::take(&mut self.scheduled);
        self.sink.flush();
        if dropped > 0 {
            debug!(dropped, "playback flushed");
        }
    }

    pub fn pending(&self) -> usize {
        self.scheduled
    }
}

/// Sink that holds frames until its owner completes them. Clones share
/// the held frames, so one clone can go to the engine while the caller keeps
/// the other to decide when playback "finishes".
#[derive(Debug, Default, Clone)]
pub struct HeldPlaybackSink {
    held: Arc<Mutex<Vec<(u64, PlaybackTicket)>>>,
}

impl HeldPlaybackSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(u64, PlaybackTicket)>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Complete all held frames.
    pub fn finish_all(&self) {
        self.lock().clear();
    }

    pub fn held(&self) -> usize {
        self.lock().len()
    }

    /// Sequence numbers of the frames still held, oldest first.
    pub fn held_seqs(&self) -> Vec<u64> {
        self.lock().iter().map(|(seq, _)| *seq).collect()
    }
}

impl PlaybackSink for HeldPlaybackSink {
    fn play(&mut self, frame: PlayableFrame, ticket: PlaybackTicket) -> VoiceResult<()> {
        self.lock().push((frame.seq, ticket));
        Ok(())
    }

    fn flush(&mut self) {
        self.lock().clear();
    }
}
