//! Bounded outbound queue and the single writer that drains it.
//!
//! Messages leave in the order they were enqueued. Priority only decides
//! what gets dropped when the queue is full: the oldest audio entry goes
//! first, and if there is no audio to evict the incoming message is
//! discarded instead.

use crate::config::UplinkMode;
use crate::error::{VoiceError, VoiceResult};
use crate::protocol::OutboundMessage;
use crate::transport::FrameSink;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Result of a successful enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// Queue was full; the oldest audio entry was evicted to make room
    EvictedAudio,
}

#[derive(Debug)]
pub struct SendQueue {
    entries: VecDeque<OutboundMessage>,
    capacity: usize,
    closed: bool,
    evicted: u64,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            closed: false,
            evicted: 0,
        }
    }

    pub fn enqueue(&mut self, msg: OutboundMessage) -> VoiceResult<Enqueued> {
        if self.closed {
            return Err(VoiceError::SessionClosed);
        }

        if self.entries.len() < self.capacity {
            self.entries.push_back(msg);
            return Ok(Enqueued::Queued);
        }

        match self.entries.iter().position(OutboundMessage::is_drop_eligible) {
            Some(idx) => {
                self.entries.remove(idx);
                self.evicted += 1;
                self.entries.push_back(msg);
                trace!(evicted = self.evicted, "send queue full, evicted oldest audio chunk");
                Ok(Enqueued::EvictedAudio)
            }
            None => Err(VoiceError::SendOverflow(msg.kind())),
        }
    }

    pub fn pop_front(&mut self) -> Option<OutboundMessage> {
        self.entries.pop_front()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Stop accepting new messages; queued ones still drain.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Audio chunks evicted so far
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutboundMessage> {
        self.entries.iter()
    }

    fn next_for_writer(&mut self) -> Next {
        match self.entries.pop_front() {
            Some(msg) => Next::Send(msg),
            None if self.closed => Next::Finished,
            None => Next::Wait,
        }
    }
}

enum Next {
    Send(OutboundMessage),
    Wait,
    Finished,
}

/// Reported by the writer when a send fails
#[derive(Debug)]
pub struct UplinkFailure(pub String);

/// Queue shared between the session task and the writer
#[derive(Clone)]
pub struct SendQueueHandle {
    inner: Arc<Shared>,
}

struct Shared {
    queue: Mutex<SendQueue>,
    notify: Notify,
}

impl SendQueueHandle {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Shared {
                queue: Mutex::new(SendQueue::new(capacity)),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SendQueue> {
        self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, msg: OutboundMessage) -> VoiceResult<Enqueued> {
        let result = self.lock().enqueue(msg);
        if result.is_ok() {
            self.inner.notify.notify_one();
        }
        result
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn close(&self) {
        self.lock().close();
        self.inner.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    fn fail_and_clear(&self) -> usize {
        let mut queue = self.lock();
        let dropped = queue.len();
        queue.clear();
        queue.close();
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Spawn the writer: sends one message at a time, in order.
    ///
    /// On a send failure the whole queue is cleared and the failure is
    /// reported once; the writer then exits. After `close()` it drains what
    /// is left and closes the sink.
    pub fn spawn_writer(
        &self,
        mut sink: Box<dyn FrameSink>,
        mode: UplinkMode,
        failures: mpsc::UnboundedSender<UplinkFailure>,
    ) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            loop {
                let next = handle.lock().next_for_writer();
                let msg = match next {
                    Next::Send(msg) => msg,
                    Next::Wait => {
                        handle.inner.notify.notified().await;
                        continue;
                    }
                    Next::Finished => {
                        if let Err(e) = sink.close().await {
                            debug!("closing sink: {}", e);
                        }
                        debug!("writer drained and closed");
                        return;
                    }
                };

                let kind = msg.kind();
                let frame = match msg.encode(mode) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("dropping unencodable {} message: {}", kind, e);
                        continue;
                    }
                };

                if let Err(e) = sink.send(frame).await {
                    let dropped = handle.fail_and_clear();
                    warn!("❌ Send of {} failed, cleared {} queued message(s): {}", kind, dropped, e);
                    let _ = failures.send(UplinkFailure(e.to_string()));
                    return;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioFrameConverter, RawFrame};
    use crate::tools::ToolCallResult;
    use crate::transport::{Connector, MemoryConnector, WireFrame};

    fn audio(conv: &mut AudioFrameConverter) -> OutboundMessage {
        OutboundMessage::AudioChunk(conv.encode(RawFrame::i16(vec![0; 320], 16_000)).unwrap())
    }

    fn audio_seqs(queue: &SendQueue) -> Vec<u64> {
        queue
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::AudioChunk(f) => Some(f.seq()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_ten_audio_into_five_keeps_newest() {
        let mut conv = AudioFrameConverter::new();
        let mut queue = SendQueue::new(5);
        for _ in 0..10 {
            queue.enqueue(audio(&mut conv)).unwrap();
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(audio_seqs(&queue), vec![5, 6, 7, 8, 9]);
        assert_eq!(queue.evicted(), 5);
    }

    #[test]
    fn test_overflow_never_drops_non_audio() {
        let mut conv = AudioFrameConverter::new();
        let mut queue = SendQueue::new(3);
        queue.enqueue(OutboundMessage::ControlEndSession).unwrap();
        queue.enqueue(audio(&mut conv)).unwrap();
        queue.enqueue(audio(&mut conv)).unwrap();

        let outcome = queue
            .enqueue(OutboundMessage::ToolResponse(ToolCallResult::success("1", "edit_findings", serde_json::json!({}))))
            .unwrap();
        assert_eq!(outcome, Enqueued::EvictedAudio);
        assert_eq!(queue.len(), 3);
        let kinds: Vec<_> = queue.iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["end_session", "audio", "tool_response"]);
        assert_eq!(audio_seqs(&queue), vec![1]);
    }

    #[test]
    fn test_full_of_control_discards_incoming() {
        let mut queue = SendQueue::new(2);
        queue.enqueue(OutboundMessage::ControlEndSession).unwrap();
        queue.enqueue(OutboundMessage::ControlEndSession).unwrap();
        let mut conv = AudioFrameConverter::new();
        let err = queue.enqueue(audio(&mut conv)).unwrap_err();
        assert!(matches!(err, VoiceError::SendOverflow("audio")));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_closed_queue_rejects() {
        let mut queue = SendQueue::new(2);
        queue.close();
        assert!(matches!(
            queue.enqueue(OutboundMessage::ControlEndSession),
            Err(VoiceError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_writer_preserves_order_and_closes() {
        let (connector, mut peers) = MemoryConnector::new();
        let (sink, _source) = connector.connect("mem://q").await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        let handle = SendQueueHandle::new(8);
        let (fail_tx, _fail_rx) = mpsc::unbounded_channel();
        let writer = handle.spawn_writer(sink, UplinkMode::Binary, fail_tx);

        let mut conv = AudioFrameConverter::new();
        for _ in 0..3 {
            handle.enqueue(audio(&mut conv)).unwrap();
        }
        handle.enqueue(OutboundMessage::ControlEndSession).unwrap();
        handle.close();
        writer.await.unwrap();

        for _ in 0..3 {
            assert!(matches!(peer.recv().await, Some(WireFrame::Binary(_))));
        }
        assert_eq!(
            peer.recv().await,
            Some(WireFrame::Text(r#"{"type":"end_session"}"#.to_string()))
        );
        assert_eq!(peer.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_failure_clears_queue() {
        let (connector, mut peers) = MemoryConnector::new();
        let (sink, _source) = connector.connect("mem://q").await.unwrap();
        let peer = peers.recv().await.unwrap();
        peer.break_uplink();

        let handle = SendQueueHandle::new(8);
        let mut conv = AudioFrameConverter::new();
        for _ in 0..4 {
            handle.enqueue(audio(&mut conv)).unwrap();
        }
        let (fail_tx, mut fail_rx) = mpsc::unbounded_channel();
        let writer = handle.spawn_writer(sink, UplinkMode::Json, fail_tx);
        writer.await.unwrap();

        assert!(fail_rx.recv().await.is_some());
        assert!(handle.is_empty());
        assert!(handle.enqueue(audio(&mut conv)).is_err());
    }
}
