//! Frame assembly for inbound transport audio.
//!
//! The transport delivers little-endian 16-bit PCM in arbitrarily sized
//! messages. [`FrameAssembler`] normalizes it to f32 and re-slices it into
//! fixed-duration [`AudioFrame`]s numbered in arrival order.

use crate::config::AudioConfig;
use crate::pipeline::messages::AudioFrame;
use std::sync::Arc;
use std::time::Instant;

/// Full-scale divisor for 16-bit PCM.
const PCM16_SCALE: f32 = 32_768.0;

/// Re-slices a PCM byte stream into fixed-size frames.
pub struct FrameAssembler {
    sample_rate: u32,
    frame_samples: usize,
    pending: Vec<f32>,
    /// Odd trailing byte from the previous message.
    carry: Option<u8>,
    next_seq: u64,
}

impl FrameAssembler {
    /// Create an assembler for the session's audio format.
    pub fn new(config: &AudioConfig) -> Self {
        let frame_samples = config.frame_samples().max(1);
        Self {
            sample_rate: config.input_sample_rate,
            frame_samples,
            pending: Vec::with_capacity(frame_samples * 2),
            carry: None,
            next_seq: 0,
        }
    }

    /// Feed raw little-endian int16 bytes; returns every completed frame.
    pub fn push_pcm16(&mut self, bytes: &[u8]) -> Vec<AudioFrame> {
        let mut bytes = bytes;
        if let Some(lo) = self.carry.take() {
            if let Some((&hi, rest)) = bytes.split_first() {
                self.pending
                    .push(i16::from_le_bytes([lo, hi]) as f32 / PCM16_SCALE);
                bytes = rest;
            } else {
                self.carry = Some(lo);
                return Vec::new();
            }
        }
        let pairs = bytes.chunks_exact(2);
        if let [last] = pairs.remainder() {
            self.carry = Some(*last);
        }
        self.pending.extend(pcm16_to_f32(bytes));
        self.drain_frames()
    }

    /// Feed already-normalized samples; returns every completed frame.
    pub fn push_samples(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);
        self.drain_frames()
    }

    /// Number of frames produced so far.
    pub fn frames_emitted(&self) -> u64 {
        self.next_seq
    }

    fn drain_frames(&mut self) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let samples: Arc<[f32]> = self.pending.drain(..self.frame_samples).collect();
            frames.push(AudioFrame {
                samples,
                sample_rate: self.sample_rate,
                seq: self.next_seq,
                received_at: Instant::now(),
            });
            self.next_seq += 1;
        }
        frames
    }
}

/// Convert little-endian int16 PCM to f32 in \[-1, 1). A trailing odd byte is ignored.
pub fn pcm16_to_f32(bytes: &[u8]) -> impl Iterator<Item = f32> + '_ {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / PCM16_SCALE)
}

/// Convert f32 samples to little-endian int16 PCM, clamping out-of-range values.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        let v = (s.clamp(-1.0, 1.0) * (PCM16_SCALE - 1.0)).round() as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}
