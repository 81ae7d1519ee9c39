//! Audio frame conversion between capture hardware and the wire format
//!
//! Uplink audio is 16-bit little-endian mono PCM at 16 kHz; downlink audio is
//! the same sample format at 24 kHz. Capture devices hand us whatever rate
//! and sample type they run at, so every captured buffer goes through
//! [`AudioFrameConverter::encode`] before it is queued for sending.

use crate::error::{VoiceError, VoiceResult};
use tracing::trace;

/// Sample rate of uplink (microphone) audio on the wire
pub const UPLINK_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of downlink (model speech) audio on the wire
pub const DOWNLINK_SAMPLE_RATE: u32 = 24_000;

/// Samples as delivered by the capture device
#[derive(Debug, Clone)]
pub enum RawSamples {
    /// Normalized to -1.0..=1.0
    F32(Vec<f32>),
    I16(Vec<i16>),
}

impl RawSamples {
    pub fn len(&self) -> usize {
        match self {
            RawSamples::F32(s) => s.len(),
            RawSamples::I16(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One mono buffer from the capture callback
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub samples: RawSamples,
    pub sample_rate: u32,
}

impl RawFrame {
    pub fn f32(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: RawSamples::F32(samples),
            sample_rate,
        }
    }

    pub fn i16(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples: RawSamples::I16(samples),
            sample_rate,
        }
    }
}

/// Wire-format uplink audio (16-bit LE mono PCM)
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
    seq: u64,
}

impl AudioFrame {
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Monotonic per-direction sequence number
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        pcm_to_le_bytes(&self.samples)
    }
}

/// Decoded downlink audio, ready for the output device
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub seq: u64,
}

impl PlayableFrame {
    pub fn duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Converts raw capture buffers into wire frames and wire bytes into
/// playable frames, numbering each direction independently.
#[derive(Debug, Default)]
pub struct AudioFrameConverter {
    uplink_seq: u64,
    downlink_seq: u64,
}

impl AudioFrameConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resample and reformat one captured buffer to 16 kHz PCM.
    ///
    /// Takes the buffer by value: once converted it cannot be fed in again.
    pub fn encode(&mut self, raw: RawFrame) -> VoiceResult<AudioFrame> {
        if raw.sample_rate == 0 {
            return Err(VoiceError::AudioHardwareUnavailable(
                "capture reported a sample rate of 0 Hz".to_string(),
            ));
        }
        if raw.samples.is_empty() {
            return Err(VoiceError::InvalidFormat("captured buffer is empty".to_string()));
        }

        let source: Vec<f32> = match raw.samples {
            RawSamples::F32(s) => s.into_iter().map(|x| x.clamp(-1.0, 1.0) * 32767.0).collect(),
            RawSamples::I16(s) => s.into_iter().map(f32::from).collect(),
        };

        let samples = resample_linear(&source, raw.sample_rate, UPLINK_SAMPLE_RATE)
            .into_iter()
            .map(|x| x.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16)
            .collect();

        let seq = self.uplink_seq;
        self.uplink_seq += 1;

        Ok(AudioFrame {
            samples,
            sample_rate: UPLINK_SAMPLE_RATE,
            seq,
        })
    }

    /// Interpret downlink bytes as 24 kHz 16-bit LE PCM.
    ///
    /// Empty payloads and odd byte counts yield `EmptyPayload`; callers treat
    /// that as "no frame" rather than a failure.
    pub fn decode(&mut self, wire: &[u8]) -> VoiceResult<PlayableFrame> {
        if wire.is_empty() || wire.len() % 2 != 0 {
            trace!(len = wire.len(), "skipping undecodable audio payload");
            return Err(VoiceError::EmptyPayload { len: wire.len() });
        }

        let samples = wire
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();

        let seq = self.downlink_seq;
        self.downlink_seq += 1;

        Ok(PlayableFrame {
            samples,
            sample_rate: DOWNLINK_SAMPLE_RATE,
            seq,
        })
    }
}

/// Output length for a resample: `ceil(n * target / source)`, at least 1.
pub fn resampled_capacity(input_len: usize, source_rate: u32, target_rate: u32) -> usize {
    let ratio = target_rate as f64 / source_rate as f64;
    ((input_len as f64 * ratio).ceil() as usize).max(1)
}

fn resample_linear(input: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate {
        return input.to_vec();
    }

    let ratio = target_rate as f64 / source_rate as f64;
    let capacity = resampled_capacity(input.len(), source_rate, target_rate);
    let last = input.len() - 1;
    let mut output = Vec::with_capacity(capacity);

    for i in 0..capacity {
        let pos = i as f64 / ratio;
        let idx = (pos.floor() as usize).min(last);
        let next = (idx + 1).min(last);
        let frac = (pos - idx as f64).clamp(0.0, 1.0) as f32;
        output.push(input[idx] + (input[next] - input[idx]) * frac);
    }

    output
}

pub fn pcm_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}
