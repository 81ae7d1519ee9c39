//! Microphone capture (cpal) and speaker playback (rodio).
//!
//! Both device objects are `!Send` on some platforms: the capture stream
//! stays with whoever started it, and the output stream lives on its own
//! thread fed through a channel.

use crate::audio::{PlayableFrame, RawFrame};
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{PlaybackSink, PlaybackTicket};
use crate::session::SessionHandle;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, Sink, Source};
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default input device streaming into a session. Drop to stop capture.
pub struct MicCapture {
    _stream: cpal::Stream,
    sample_rate: u32,
}

impl MicCapture {
    pub fn start(handle: SessionHandle) -> VoiceResult<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| VoiceError::AudioHardwareUnavailable("no input device".to_string()))?;
        let supported = device.default_input_config()?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels() as usize;
        let config: cpal::StreamConfig = supported.config();

        if sample_rate == 0 {
            return Err(VoiceError::AudioHardwareUnavailable(
                "input device reports a zero sample rate".to_string(),
            ));
        }
        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
            sample_rate, channels, "🎤 Starting microphone capture"
        );

        let on_error = |err: cpal::StreamError| warn!("Audio stream error: {}", err);
        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if handle.is_mic_open() {
                        handle.push_audio(RawFrame::f32(downmix(data, channels, |s| s), sample_rate));
                    }
                },
                on_error,
                None,
            )?,
            cpal::SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    if handle.is_mic_open() {
                        let mono = downmix(data, channels, |s| s as f32 / 32768.0);
                        handle.push_audio(RawFrame::f32(mono, sample_rate));
                    }
                },
                on_error,
                None,
            )?,
            other => {
                return Err(VoiceError::InvalidFormat(format!(
                    "unsupported input sample format {other:?}"
                )))
            }
        };
        stream.play()?;

        info!("✅ Microphone capture started");
        Ok(Self {
            _stream: stream,
            sample_rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

fn downmix<T: Copy>(data: &[T], channels: usize, to_f32: impl Fn(T) -> f32) -> Vec<f32> {
    let channels = channels.max(1);
    data.chunks(channels)
        .map(|frame| frame.iter().map(|&s| to_f32(s)).sum::<f32>() / frame.len() as f32)
        .collect()
}

enum SpeakerCommand {
    Play(PlayableFrame, PlaybackTicket),
    Flush,
}

/// Default output device as a [`PlaybackSink`]
pub struct SpeakerOutput {
    tx: std_mpsc::Sender<SpeakerCommand>,
}

impl SpeakerOutput {
    pub fn open() -> VoiceResult<Self> {
        let (tx, rx) = std_mpsc::channel::<SpeakerCommand>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();

        thread::spawn(move || {
            let (_stream, stream_handle) = match OutputStream::try_default() {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = ready_tx.send(Err(VoiceError::AudioHardwareUnavailable(e.to_string())));
                    return;
                }
            };
            let mut sink = match Sink::try_new(&stream_handle) {
                Ok(sink) => sink,
                Err(e) => {
                    let _ = ready_tx.send(Err(VoiceError::AudioHardwareUnavailable(e.to_string())));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            info!("🔊 Speaker output ready");

            while let Ok(cmd) = rx.recv() {
                match cmd {
                    SpeakerCommand::Play(frame, ticket) => sink.append(TicketSource::new(frame, ticket)),
                    SpeakerCommand::Flush => {
                        // a dropped sink stops its sources, releasing their tickets
                        sink.stop();
                        match Sink::try_new(&stream_handle) {
                            Ok(fresh) => sink = fresh,
                            Err(e) => {
                                warn!("recreating output sink failed: {}", e);
                                return;
                            }
                        }
                        debug!("speaker flushed");
                    }
                }
            }
            debug!("speaker thread exiting");
        });

        ready_rx
            .recv()
            .map_err(|_| VoiceError::AudioHardwareUnavailable("output thread exited".to_string()))??;
        Ok(Self { tx })
    }
}

impl PlaybackSink for SpeakerOutput {
    fn play(&mut self, frame: PlayableFrame, ticket: PlaybackTicket) -> VoiceResult<()> {
        self.tx
            .send(SpeakerCommand::Play(frame, ticket))
            .map_err(|_| VoiceError::AudioHardwareUnavailable("output thread stopped".to_string()))
    }

    fn flush(&mut self) {
        let _ = self.tx.send(SpeakerCommand::Flush);
    }
}

/// Plays one frame and drops its ticket when exhausted.
struct TicketSource {
    inner: SamplesBuffer<i16>,
    ticket: Option<PlaybackTicket>,
}

impl TicketSource {
    fn new(frame: PlayableFrame, ticket: PlaybackTicket) -> Self {
        Self {
            inner: SamplesBuffer::new(1, frame.sample_rate, frame.samples),
            ticket: Some(ticket),
        }
    }
}

impl Iterator for TicketSource {
    type Item = i16;

    fn next(&mut self) -> Option<i16> {
        let sample = self.inner.next();
        if sample.is_none() {
            self.ticket.take();
        }
        sample
    }
}

impl Source for TicketSource {
    fn current_frame_len(&self) -> Option<usize> {
        self.inner.current_frame_len()
    }

    fn channels(&self) -> u16 {
        self.inner.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        self.inner.total_duration()
    }
}
