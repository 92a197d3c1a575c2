//! Audio ingest and PCM/WAV format conversion.

pub mod ingest;
pub mod wav;

pub use ingest::{FrameAssembler, f32_to_pcm16, pcm16_to_f32};
pub use wav::{decode_wav_mono, encode_wav_pcm16};
