//! Language model streaming and response chunking.
//!
//! The [`LanguageModel`] trait is the seam to the external chat completion
//! service. [`ApiLlm`] talks to any OpenAI-compatible server (Ollama, vLLM,
//! llama.cpp, MLX). [`ResponseGenerator`] turns a token stream into ordered
//! [`TextChunk`](crate::pipeline::messages::TextChunk)s.

pub mod api;
pub mod chunker;
pub mod context;
pub mod extract;
pub mod generator;

pub use api::ApiLlm;
pub use chunker::SentenceChunker;
pub use context::{ChatMessage, ConversationHistory, HistoryEntry, Prompt, Role};
pub use extract::extract_order;
pub use generator::{GenerationOutcome, GenerationSummary, ResponseGenerator, ResponseStream};

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Streaming chat completion service.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Start a completion for `prompt`.
    ///
    /// Tokens arrive in order on the returned channel; a mid-stream failure
    /// arrives as an `Err` item and ends the stream. Dropping the receiver
    /// stops consumption of the underlying stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not be started.
    async fn stream(&self, prompt: &Prompt) -> Result<mpsc::Receiver<Result<String>>>;
}
