//! Parley: real-time full-duplex voice conversation core.
//!
//! One [`ConversationSession`] per audio connection runs a cascaded pipeline:
//! inbound PCM → VAD → ASR → LLM → sentence chunker → TTS worker pool →
//! playback sequencer → outbound PCM.
//!
//! # Architecture
//!
//! The stages are tokio tasks connected by channels:
//! - **Ingest**: reframes inbound int16 PCM into fixed-size frames
//! - **VAD**: energy-based speech start/end detection with hangover
//! - **ASR**: per-utterance transcription through a [`asr::SpeechRecognizer`]
//! - **LLM**: streamed completion through a [`llm::LanguageModel`], cut into
//!   speakable sentences
//! - **TTS**: a bounded pool of synthesis workers that may finish out of order
//! - **Playback**: reorders chunks by index and paces them to the transport
//!
//! A turn coordinator tracks whose turn it is; user speech during agent
//! speech cancels the live response (barge-in).

pub mod asr;
pub mod audio;
pub mod config;
pub mod error;
pub mod llm;
pub mod parley_dirs;
pub mod pipeline;
pub mod playback;
pub mod runtime;
pub mod server;
pub mod services;
pub mod tts;
pub mod vad;

pub use config::SessionConfig;
pub use error::{Result, VoiceError};
pub use pipeline::ConversationSession;
pub use runtime::RuntimeEvent;
