//! Reordering of synthesized chunks into index order.

use crate::pipeline::messages::{AudioChunk, SequenceId};
use std::collections::BTreeMap;
use tracing::debug;

/// Holds out-of-order chunks and releases them strictly in index order.
///
/// Only one sequence is live at a time. Chunks for any other sequence,
/// duplicates, and indices already released are dropped.
#[derive(Debug, Default)]
pub struct PlaybackSequencer {
    live: Option<LiveSequence>,
}

#[derive(Debug)]
struct LiveSequence {
    sequence_id: SequenceId,
    next_index: u64,
    pending: BTreeMap<u64, AudioChunk>,
    total: Option<u64>,
}

impl PlaybackSequencer {
    /// Create an idle sequencer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `sequence_id` the live sequence, starting at index 0.
    ///
    /// Returns the previously live sequence if one was replaced unfinished.
    pub fn begin(&mut self, sequence_id: SequenceId) -> Option<SequenceId> {
        let replaced = self.live.take().map(|l| l.sequence_id);
        self.live = Some(LiveSequence {
            sequence_id,
            next_index: 0,
            pending: BTreeMap::new(),
            total: None,
        });
        replaced
    }

    /// Currently live sequence.
    pub fn live(&self) -> Option<SequenceId> {
        self.live.as_ref().map(|l| l.sequence_id)
    }

    /// Next index that will be released.
    pub fn next_index(&self) -> Option<u64> {
        self.live.as_ref().map(|l| l.next_index)
    }

    /// Chunks held waiting for an earlier index.
    pub fn pending_len(&self) -> usize {
        self.live.as_ref().map_or(0, |l| l.pending.len())
    }

    /// Take a completed chunk; returns every chunk now releasable, in order.
    pub fn accept(&mut self, chunk: AudioChunk) -> Vec<AudioChunk> {
        let Some(live) = self.live.as_mut() else {
            debug!("dropping chunk {}#{}: no live sequence", chunk.sequence_id, chunk.index);
            return Vec::new();
        };
        if chunk.sequence_id != live.sequence_id {
            debug!(
                "dropping chunk {}#{}: live sequence is {}",
                chunk.sequence_id, chunk.index, live.sequence_id
            );
            return Vec::new();
        }
        if chunk.index < live.next_index || live.pending.contains_key(&chunk.index) {
            debug!("dropping duplicate chunk {}#{}", chunk.sequence_id, chunk.index);
            return Vec::new();
        }
        if live.total.is_some_and(|total| chunk.index >= total) {
            debug!("dropping chunk {}#{} past end of sequence", chunk.sequence_id, chunk.index);
            return Vec::new();
        }

        live.pending.insert(chunk.index, chunk);
        let mut ready = Vec::new();
        while let Some(next) = live.pending.remove(&live.next_index) {
            ready.push(next);
            live.next_index += 1;
        }
        ready
    }

    /// Record how many chunks `sequence_id` has in total.
    pub fn set_total(&mut self, sequence_id: SequenceId, total: u64) {
        if let Some(live) = self.live.as_mut().filter(|l| l.sequence_id == sequence_id) {
            live.total = Some(total);
        }
    }

    /// Whether every chunk of the live sequence has been released.
    pub fn is_complete(&self) -> bool {
        self.live
            .as_ref()
            .is_some_and(|l| l.total == Some(l.next_index))
    }

    /// Cancel `sequence_id` if it is live, dropping held chunks.
    ///
    /// Returns `true` if the live sequence was cancelled.
    pub fn cancel(&mut self, sequence_id: SequenceId) -> bool {
        if self.live() != Some(sequence_id) {
            return false;
        }
        if let Some(live) = self.live.take() {
            debug!(
                "cancelled sequence {sequence_id} at index {} ({} held chunks dropped)",
                live.next_index,
                live.pending.len()
            );
        }
        true
    }

    /// Retire a completed sequence.
    pub fn finish(&mut self) -> Option<SequenceId> {
        if self.is_complete() {
            self.live.take().map(|l| l.sequence_id)
        } else {
            None
        }
    }
}
