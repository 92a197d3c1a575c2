//! Message types passed between pipeline stages.

use crate::error::VoiceError;
use crate::llm::GenerationSummary;
use std::sync::Arc;
use std::time::Instant;

/// Identifier of one response's chunk sequence within a session.
pub type SequenceId = u64;

/// A fixed-duration block of mono PCM from the transport.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Normalized f32 samples in \[-1, 1\].
    pub samples: Arc<[f32]>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Monotonic frame number within the session.
    pub seq: u64,
    /// When the frame was assembled.
    pub received_at: Instant,
}

impl AudioFrame {
    /// Duration of this frame in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 * 1000.0 / self.sample_rate as f64
    }
}

/// Frames between a detected speech start and speech end.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Frames in arrival order, including pre-roll.
    pub frames: Vec<AudioFrame>,
    /// When the first (pre-roll) frame arrived.
    pub started_at: Instant,
}

impl Utterance {
    /// Total duration in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        self.frames.iter().map(AudioFrame::duration_ms).sum()
    }
}

/// A transcription result from the ASR service.
#[derive(Debug, Clone)]
pub struct Transcription {
    /// Utterance this transcript belongs to.
    pub utterance_id: u64,
    /// The transcribed text.
    pub text: String,
    /// When the utterance started.
    pub audio_started_at: Instant,
    /// When the transcript was produced.
    pub transcribed_at: Instant,
}

/// A speakable span of generated text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Response this chunk belongs to.
    pub sequence_id: SequenceId,
    /// Position within the response, starting at 0.
    pub index: u64,
    /// Chunk text, trimmed.
    pub text: String,
}

/// What a sequenced slot carries to playback.
#[derive(Debug, Clone)]
pub enum ChunkPayload {
    /// Synthesized speech.
    Audio {
        /// f32 samples.
        samples: Vec<f32>,
        /// Sample rate in Hz.
        sample_rate: u32,
    },
    /// Synthesis failed; a gap of this length stands in for the chunk.
    Skipped {
        /// Gap length in milliseconds.
        gap_ms: u32,
        /// Why the chunk was skipped.
        reason: String,
    },
}

/// Synthesis output for one [`TextChunk`].
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Response this chunk belongs to.
    pub sequence_id: SequenceId,
    /// Same index as the source text chunk.
    pub index: u64,
    /// Text that was synthesized.
    pub text: String,
    /// Audio or skip marker.
    pub payload: ChunkPayload,
}

impl AudioChunk {
    /// Whether this chunk stands in for a failed synthesis.
    pub fn is_skipped(&self) -> bool {
        matches!(self.payload, ChunkPayload::Skipped { .. })
    }
}

/// Messages written to the outbound audio transport.
#[derive(Debug, Clone)]
pub enum OutboundAudio {
    /// One in-order chunk of speech (or gap).
    Chunk(AudioChunk),
    /// Discard anything buffered for this sequence (barge-in).
    Truncate {
        /// Cancelled sequence.
        sequence_id: SequenceId,
    },
}

/// Events reported back to the session loop by stage tasks.
#[derive(Debug)]
pub enum ControlEvent {
    /// The ASR service produced a final transcript.
    Transcript(Transcription),
    /// Interim text for the utterance in progress.
    PartialTranscript {
        /// Utterance being recognized.
        utterance_id: u64,
        /// Best guess so far.
        text: String,
    },
    /// Finalization failed or timed out; the utterance is dropped.
    AsrFailed {
        /// Utterance that could not be transcribed.
        utterance_id: u64,
        /// What went wrong.
        error: VoiceError,
    },
    /// The first chunk of a sequence reached the transport.
    PlaybackStarted {
        /// Sequence that started.
        sequence_id: SequenceId,
    },
    /// A chunk (or its gap) was written to the transport.
    ChunkPlayed {
        /// Sequence the chunk belongs to.
        sequence_id: SequenceId,
        /// Chunk index.
        index: u64,
        /// Chunk text.
        text: String,
        /// Why synthesis was skipped, if it was.
        skipped: Option<String>,
    },
    /// Every chunk of a sequence was written and its audio has had time to play.
    PlaybackFinished {
        /// Sequence that finished.
        sequence_id: SequenceId,
    },
    /// The generator task ended.
    GenerationFinished(GenerationSummary),
}
