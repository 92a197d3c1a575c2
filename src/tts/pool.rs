//! Bounded-concurrency synthesis of a response's text chunks.
//!
//! A dispatcher task takes chunks in index order and acquires a pool permit
//! for each before spawning its worker, so no chunk starts synthesis before
//! an earlier one of the same sequence has started. Workers complete in any
//! order; the playback sequencer restores index order. The permit pool is
//! shared by every sequence of a session.

use super::SpeechSynthesizer;
use crate::config::{TtsConfig, TtsFailurePolicy, WorkerCancelMode};
use crate::error::VoiceError;
use crate::pipeline::messages::{AudioChunk, ChunkPayload, SequenceId, TextChunk};
use crate::playback::PlaybackInput;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a dispatcher did for one sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Sequence that was dispatched.
    pub sequence_id: SequenceId,
    /// Chunks handed to a worker.
    pub dispatched: u64,
    /// Chunks replaced by a silence gap.
    pub skipped: u64,
    /// The sequence was cancelled before dispatch finished.
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
struct WorkerSettings {
    voice_id: String,
    speed: f32,
    timeout: Duration,
    attempts: u32,
    backoff: Duration,
    skip_gap_ms: u32,
    cancel_mode: WorkerCancelMode,
}

/// Fixed-size pool of concurrent synthesis calls.
#[derive(Clone)]
pub struct TtsWorkerPool {
    tts: Arc<dyn SpeechSynthesizer>,
    settings: Arc<WorkerSettings>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl TtsWorkerPool {
    /// Create a pool of `config.pool_size` workers over `tts`.
    pub fn new(tts: Arc<dyn SpeechSynthesizer>, config: &TtsConfig) -> Self {
        let size = config.pool_size.max(1);
        let attempts = match config.failure_policy {
            TtsFailurePolicy::Skip => 1,
            TtsFailurePolicy::RetryOnce => 2,
        };
        Self {
            tts,
            settings: Arc::new(WorkerSettings {
                voice_id: config.voice_id.clone(),
                speed: config.speed,
                timeout: Duration::from_millis(config.synth_timeout_ms),
                attempts,
                backoff: Duration::from_millis(config.retry_backoff_ms),
                skip_gap_ms: config.skip_gap_ms,
                cancel_mode: config.cancel_mode,
            }),
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Configured worker count.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently idle.
    pub fn idle_workers(&self) -> usize {
        self.permits.available_permits()
    }

    /// Synthesize every chunk from `chunks`, sending results to `out`.
    ///
    /// Once `chunks` closes, [`PlaybackInput::End`] carries the chunk count.
    /// After `cancel` fires no further chunk is dispatched or sent.
    pub fn dispatch(
        &self,
        sequence_id: SequenceId,
        chunks: mpsc::Receiver<TextChunk>,
        out: mpsc::Sender<PlaybackInput>,
        cancel: CancellationToken,
    ) -> JoinHandle<DispatchSummary> {
        let pool = self.clone();
        tokio::spawn(async move { pool.run_dispatcher(sequence_id, chunks, out, cancel).await })
    }

    async fn run_dispatcher(
        self,
        sequence_id: SequenceId,
        mut chunks: mpsc::Receiver<TextChunk>,
        out: mpsc::Sender<PlaybackInput>,
        cancel: CancellationToken,
    ) -> DispatchSummary {
        let mut workers: JoinSet<bool> = JoinSet::new();
        let mut dispatched: u64 = 0;
        let mut cancelled = false;

        loop {
            let chunk = tokio::select! {
                biased;
                () = cancel.cancelled() => { cancelled = true; break; }
                next = chunks.recv() => match next {
                    Some(chunk) => chunk,
                    None => break,
                },
            };

            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => { cancelled = true; break; }
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("TTS permit pool closed");
                        break;
                    }
                },
            };

            dispatched += 1;
            debug!("dispatch {}#{} to TTS", chunk.sequence_id, chunk.index);
            let tts = Arc::clone(&self.tts);
            let settings = Arc::clone(&self.settings);
            let out = out.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                let _permit = permit;
                let audio = synthesize_chunk(tts.as_ref(), &settings, chunk).await;
                let skipped = audio.is_skipped();
                if cancel.is_cancelled() {
                    return skipped;
                }
                let _ = out.send(PlaybackInput::Chunk(audio)).await;
                skipped
            });
        }

        if !cancelled {
            let _ = out
                .send(PlaybackInput::End {
                    sequence_id,
                    total: dispatched,
                })
                .await;
        }

        let mut skipped: u64 = 0;
        loop {
            let joined = if cancelled {
                None
            } else {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => { cancelled = true; None }
                    joined = workers.join_next() => Some(joined),
                }
            };
            match joined {
                Some(Some(Ok(true))) => skipped += 1,
                Some(Some(Ok(false))) => {}
                Some(Some(Err(e))) => warn!("TTS worker for sequence {sequence_id} failed: {e}"),
                Some(None) => break,
                None => {
                    match self.settings.cancel_mode {
                        WorkerCancelMode::Abandon => workers.abort_all(),
                        WorkerCancelMode::Drain => workers.detach_all(),
                    }
                    break;
                }
            }
        }

        info!(
            "sequence {sequence_id}: dispatched {dispatched} chunks, {skipped} skipped{}",
            if cancelled { " [cancelled]" } else { "" }
        );
        DispatchSummary {
            sequence_id,
            dispatched,
            skipped,
            cancelled,
        }
    }
}

/// Run one synthesis with timeout and retry policy; never fails.
async fn synthesize_chunk(
    tts: &dyn SpeechSynthesizer,
    settings: &WorkerSettings,
    chunk: TextChunk,
) -> AudioChunk {
    let mut last_error = VoiceError::Tts("no attempt made".to_owned());
    for attempt in 1..=settings.attempts {
        let call = tts.synthesize(&chunk.text, &settings.voice_id, settings.speed);
        match tokio::time::timeout(settings.timeout, call).await {
            Ok(Ok(audio)) => {
                return AudioChunk {
                    sequence_id: chunk.sequence_id,
                    index: chunk.index,
                    text: chunk.text,
                    payload: ChunkPayload::Audio {
                        samples: audio.samples,
                        sample_rate: audio.sample_rate,
                    },
                };
            }
            Ok(Err(e)) => last_error = e,
            Err(_) => {
                last_error = VoiceError::Timeout {
                    stage: "tts",
                    millis: u64::try_from(settings.timeout.as_millis()).unwrap_or(u64::MAX),
                };
            }
        }
        warn!(
            "TTS attempt {attempt}/{} for {}#{} failed: {last_error}",
            settings.attempts, chunk.sequence_id, chunk.index
        );
        if attempt == settings.attempts || !last_error.is_retryable() {
            break;
        }
        tokio::time::sleep(settings.backoff).await;
    }

    AudioChunk {
        sequence_id: chunk.sequence_id,
        index: chunk.index,
        text: chunk.text,
        payload: ChunkPayload::Skipped {
            gap_ms: settings.skip_gap_ms,
            reason: last_error.to_string(),
        },
    }
}
