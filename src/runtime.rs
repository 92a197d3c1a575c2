//! Runtime events emitted by a session for clients and observability.
//!
//! Events are broadcast without blocking the session loop; slow subscribers
//! lag and lose events rather than stall the pipeline.

use crate::pipeline::messages::SequenceId;
use crate::pipeline::turn::TurnState;
use serde::Serialize;

/// Events that describe what a session is doing "right now".
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// The VAD confirmed the start of user speech.
    SpeechStarted {
        /// Utterance number within the session.
        utterance_id: u64,
    },
    /// The VAD closed an utterance long enough to transcribe.
    SpeechEnded {
        /// Utterance number within the session.
        utterance_id: u64,
        /// Voiced duration in milliseconds.
        voiced_ms: u64,
    },
    /// The turn state changed.
    Turn {
        /// Previous state.
        from: TurnState,
        /// New state.
        to: TurnState,
    },
    /// Interim transcript while the user is still speaking. Display only.
    PartialTranscript {
        /// Utterance number within the session.
        utterance_id: u64,
        /// Text recognized so far.
        text: String,
    },
    /// Final user transcript.
    Transcript {
        /// Utterance number within the session.
        utterance_id: u64,
        /// Transcribed text.
        text: String,
    },
    /// A chunk of the agent's reply reached the transport.
    AssistantChunk {
        /// Response sequence.
        sequence_id: SequenceId,
        /// Chunk index.
        index: u64,
        /// Chunk text.
        text: String,
    },
    /// A chunk could not be synthesized and was replaced by silence.
    ChunkSkipped {
        /// Response sequence.
        sequence_id: SequenceId,
        /// Chunk index.
        index: u64,
        /// Failure reason.
        reason: String,
    },
    /// The user spoke over the agent; the response was cancelled.
    BargeIn {
        /// Cancelled sequence.
        sequence_id: SequenceId,
    },
    /// A response finished (or failed) and the session is listening again.
    ResponseFinished {
        /// Response sequence.
        sequence_id: SequenceId,
        /// Full response text.
        text: String,
        /// Failure description when the LLM call did not complete.
        error: Option<String>,
    },
    /// A non-fatal stage failure (ASR, LLM).
    Error {
        /// Failing stage.
        stage: String,
        /// Error description.
        message: String,
    },
    /// The agent said a closing phrase; the conversation is over.
    ConversationFinished {
        /// Phrase that matched.
        phrase: String,
    },
    /// Structured order pulled from the finished conversation.
    OrderExtracted {
        /// Order JSON as returned by the model.
        order: serde_json::Value,
    },
}
