//! Ordered playback of synthesized chunks to the outbound transport.
//!
//! The playback stage owns a [`PlaybackSequencer`] and is the only writer of
//! agent audio. Before every write it checks the live sequence's
//! cancellation token, so once the session cancels a sequence nothing more
//! from it reaches the transport.

pub mod sequencer;

pub use sequencer::PlaybackSequencer;

use crate::pipeline::messages::{AudioChunk, ChunkPayload, ControlEvent, OutboundAudio, SequenceId};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Inputs to the playback stage.
#[derive(Debug)]
pub enum PlaybackInput {
    /// A new response sequence becomes live.
    Begin {
        /// The new sequence.
        sequence_id: SequenceId,
        /// Fires when the sequence is cancelled.
        cancel: CancellationToken,
    },
    /// A synthesized (or skipped) chunk, in any order.
    Chunk(AudioChunk),
    /// No more chunks will be produced; `total` chunks exist.
    End {
        /// Sequence that ended.
        sequence_id: SequenceId,
        /// Number of chunks in the sequence.
        total: u64,
    },
    /// Drop the sequence and tell the transport to discard buffered audio.
    Cancel {
        /// Sequence to cancel.
        sequence_id: SequenceId,
    },
}

/// Channels the playback stage reports through.
pub(crate) struct PlaybackStageControl {
    pub out: mpsc::Sender<OutboundAudio>,
    pub control_tx: mpsc::UnboundedSender<ControlEvent>,
    pub cancel: CancellationToken,
}

struct LiveState {
    sequence_id: SequenceId,
    token: CancellationToken,
    started: bool,
    /// When the client will have finished playing everything written so far.
    playback_end: Option<Instant>,
    /// Set once every chunk is written; fires `PlaybackFinished`.
    finish_at: Option<Instant>,
}

/// Run the playback stage until the session is cancelled or its input closes.
pub(crate) async fn run_playback_stage(mut rx: mpsc::Receiver<PlaybackInput>, ctl: PlaybackStageControl) {
    let mut sequencer = PlaybackSequencer::new();
    let mut live: Option<LiveState> = None;

    loop {
        let finish_at = live.as_ref().and_then(|l| l.finish_at);
        let deadline = finish_at.unwrap_or_else(Instant::now);

        tokio::select! {
            biased;
            () = ctl.cancel.cancelled() => break,
            () = tokio::time::sleep_until(deadline), if finish_at.is_some() => {
                if let Some(state) = live.take() {
                    sequencer.finish();
                    if !state.token.is_cancelled() {
                        info!("sequence {} playback finished", state.sequence_id);
                        let _ = ctl.control_tx.send(ControlEvent::PlaybackFinished {
                            sequence_id: state.sequence_id,
                        });
                    }
                }
            }
            input = rx.recv() => {
                let Some(input) = input else { break };
                match input {
                    PlaybackInput::Begin { sequence_id, cancel } => {
                        if let Some(prev) = sequencer.begin(sequence_id) {
                            warn!("sequence {prev} replaced before it finished");
                        }
                        live = Some(LiveState {
                            sequence_id,
                            token: cancel,
                            started: false,
                            playback_end: None,
                            finish_at: None,
                        });
                    }
                    PlaybackInput::Chunk(chunk) => {
                        let Some(state) = live.as_mut() else {
                            debug!("chunk {}#{} with no live sequence", chunk.sequence_id, chunk.index);
                            continue;
                        };
                        for ready in sequencer.accept(chunk) {
                            if !emit(state, ready, &ctl).await {
                                break;
                            }
                        }
                        mark_if_complete(state, &sequencer);
                    }
                    PlaybackInput::End { sequence_id, total } => {
                        sequencer.set_total(sequence_id, total);
                        if let Some(state) = live.as_mut().filter(|s| s.sequence_id == sequence_id) {
                            mark_if_complete(state, &sequencer);
                        }
                    }
                    PlaybackInput::Cancel { sequence_id } => {
                        if sequencer.cancel(sequence_id) {
                            live = None;
                            let _ = ctl.out.send(OutboundAudio::Truncate { sequence_id }).await;
                            info!("sequence {sequence_id} truncated");
                        }
                    }
                }
            }
        }
    }
}

/// Write one in-order chunk unless its sequence was cancelled.
///
/// Returns `false` once the sequence is cancelled or the transport is gone.
async fn emit(state: &mut LiveState, chunk: AudioChunk, ctl: &PlaybackStageControl) -> bool {
    if state.token.is_cancelled() {
        return false;
    }

    let duration = chunk_duration(&chunk);
    let index = chunk.index;
    let text = chunk.text.clone();
    let skipped = match &chunk.payload {
        ChunkPayload::Skipped { reason, .. } => Some(reason.clone()),
        ChunkPayload::Audio { .. } => None,
    };

    let sent = tokio::select! {
        biased;
        () = state.token.cancelled() => return false,
        sent = ctl.out.send(OutboundAudio::Chunk(chunk)) => sent,
    };
    if sent.is_err() {
        warn!("outbound transport closed during sequence {}", state.sequence_id);
        return false;
    }

    let now = Instant::now();
    let start = state.playback_end.map_or(now, |end| end.max(now));
    state.playback_end = Some(start + duration);

    if !state.started {
        state.started = true;
        let _ = ctl.control_tx.send(ControlEvent::PlaybackStarted {
            sequence_id: state.sequence_id,
        });
    }
    let _ = ctl.control_tx.send(ControlEvent::ChunkPlayed {
        sequence_id: state.sequence_id,
        index,
        text,
        skipped,
    });
    true
}

fn mark_if_complete(state: &mut LiveState, sequencer: &PlaybackSequencer) {
    if state.finish_at.is_none() && sequencer.is_complete() && !state.token.is_cancelled() {
        let now = Instant::now();
        state.finish_at = Some(state.playback_end.map_or(now, |end| end.max(now)));
    }
}

/// Audible length of a chunk once played.
pub fn chunk_duration(chunk: &AudioChunk) -> Duration {
    match &chunk.payload {
        ChunkPayload::Audio {
            samples,
            sample_rate,
        } => {
            if *sample_rate == 0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64(samples.len() as f64 / f64::from(*sample_rate))
            }
        }
        ChunkPayload::Skipped { gap_ms, .. } => Duration::from_millis(u64::from(*gap_ms)),
    }
}
