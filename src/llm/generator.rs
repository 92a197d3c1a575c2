//! Streaming response generation.
//!
//! [`ResponseGenerator::generate`] starts one task per response. The task
//! pulls tokens from the [`LanguageModel`], feeds them through a
//! [`SentenceChunker`], and sends each completed [`TextChunk`] downstream as
//! soon as it exists. Cancellation stops token consumption at once and drops
//! the LLM stream; no chunk is sent after the token fires.

use super::LanguageModel;
use super::chunker::SentenceChunker;
use super::context::Prompt;
use crate::config::{ChunkerConfig, LlmConfig};
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::{SequenceId, TextChunk};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Buffered text chunks between the generator and the TTS dispatcher.
const CHUNK_CHANNEL_SIZE: usize = 16;

/// How a generation ended.
#[derive(Debug)]
pub enum GenerationOutcome {
    /// The stream ended normally and every chunk was sent.
    Completed,
    /// The cancellation token fired.
    Cancelled,
    /// The LLM call failed or stalled. Chunks already sent stay valid.
    Failed(VoiceError),
}

/// Result of one generation, reported once the task ends.
#[derive(Debug)]
pub struct GenerationSummary {
    /// Response this summary belongs to.
    pub sequence_id: SequenceId,
    /// All visible text received from the model.
    pub text: String,
    /// Number of chunks sent downstream.
    pub chunk_count: u64,
    /// How the generation ended.
    pub outcome: GenerationOutcome,
}

impl GenerationSummary {
    /// Whether the generation was cut short by cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, GenerationOutcome::Cancelled)
    }
}

/// Handle to a running generation.
pub struct ResponseStream {
    /// Chunks in index order; closes when the generation ends.
    pub chunks: mpsc::Receiver<TextChunk>,
    /// Resolves to the summary once the task ends.
    pub handle: JoinHandle<GenerationSummary>,
}

/// Produces chunked responses from a language model.
#[derive(Clone)]
pub struct ResponseGenerator {
    llm: Arc<dyn LanguageModel>,
    max_chunk_chars: usize,
    stall_timeout: Duration,
}

impl ResponseGenerator {
    /// Create a generator over `llm`.
    pub fn new(llm: Arc<dyn LanguageModel>, llm_config: &LlmConfig, chunker: &ChunkerConfig) -> Self {
        Self {
            llm,
            max_chunk_chars: chunker.max_chunk_chars,
            stall_timeout: Duration::from_millis(llm_config.stall_timeout_ms),
        }
    }

    /// Start generating a response to `prompt` as sequence `sequence_id`.
    pub fn generate(
        &self,
        prompt: Prompt,
        sequence_id: SequenceId,
        cancel: CancellationToken,
    ) -> ResponseStream {
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_SIZE);
        let worker = GenerationTask {
            llm: Arc::clone(&self.llm),
            chunker: SentenceChunker::new(sequence_id, self.max_chunk_chars),
            stall_timeout: self.stall_timeout,
            sequence_id,
            text: String::new(),
        };
        let handle = tokio::spawn(worker.run(prompt, tx, cancel));
        ResponseStream { chunks: rx, handle }
    }
}

struct GenerationTask {
    llm: Arc<dyn LanguageModel>,
    chunker: SentenceChunker,
    stall_timeout: Duration,
    sequence_id: SequenceId,
    text: String,
}

impl GenerationTask {
    async fn run(
        mut self,
        prompt: Prompt,
        tx: mpsc::Sender<TextChunk>,
        cancel: CancellationToken,
    ) -> GenerationSummary {
        let started = Instant::now();
        let outcome = match self.stream_chunks(&prompt, &tx, &cancel).await {
            Ok(()) => GenerationOutcome::Completed,
            Err(VoiceError::Cancelled) => GenerationOutcome::Cancelled,
            Err(e) => {
                warn!("response {} generation failed: {e}", self.sequence_id);
                GenerationOutcome::Failed(e)
            }
        };

        info!(
            "response {} generated {} chunks in {:.1}s{}",
            self.sequence_id,
            self.chunker.emitted(),
            started.elapsed().as_secs_f64(),
            match outcome {
                GenerationOutcome::Completed => "",
                GenerationOutcome::Cancelled => " [cancelled]",
                GenerationOutcome::Failed(_) => " [failed]",
            }
        );

        GenerationSummary {
            sequence_id: self.sequence_id,
            text: self.text.trim().to_owned(),
            chunk_count: self.chunker.emitted(),
            outcome,
        }
    }

    async fn stream_chunks(
        &mut self,
        prompt: &Prompt,
        tx: &mpsc::Sender<TextChunk>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut tokens = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(VoiceError::Cancelled),
            started = tokio::time::timeout(self.stall_timeout, self.llm.stream(prompt)) => {
                started.map_err(|_| self.stall_error())??
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(VoiceError::Cancelled),
                next = tokio::time::timeout(self.stall_timeout, tokens.recv()) => {
                    next.map_err(|_| self.stall_error())?
                }
            };
            let Some(token) = next else { break };
            let token = token?;
            self.text.push_str(&token);
            for chunk in self.chunker.push(&token) {
                send_chunk(tx, chunk, cancel).await?;
            }
        }

        if let Some(chunk) = self.chunker.finish() {
            send_chunk(tx, chunk, cancel).await?;
        }
        Ok(())
    }

    fn stall_error(&self) -> VoiceError {
        VoiceError::Timeout {
            stage: "llm",
            millis: u64::try_from(self.stall_timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

async fn send_chunk(
    tx: &mpsc::Sender<TextChunk>,
    chunk: TextChunk,
    cancel: &CancellationToken,
) -> Result<()> {
    debug!("chunk {}#{}: {}", chunk.sequence_id, chunk.index, chunk.text);
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(VoiceError::Cancelled),
        sent = tx.send(chunk) => sent.map_err(|_| VoiceError::Channel("chunk receiver dropped".to_owned())),
    }
}
