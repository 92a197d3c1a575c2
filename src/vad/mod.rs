//! Voice Activity Detection using energy-based analysis.
//!
//! Each frame's RMS energy is compared against a threshold and fed through a
//! four-state machine with start/end debounce counters:
//!
//! ```text
//! Silence ──above──▶ SpeechStarting ──start_frames above──▶ Speech
//!    ▲                    │ below                            │ below
//!    └────────────────────┘                                  ▼
//!    └──────────── end_frames below ──────────────── SpeechEnding
//!                                                      │ above ──▶ Speech
//! ```
//!
//! Utterances whose voiced span is shorter than `min_utterance_ms` are
//! discarded without a `SpeechEnd`.

use crate::config::VadConfig;
use crate::pipeline::messages::{AudioFrame, Utterance};
use std::collections::VecDeque;
use tracing::{debug, info};

/// Detector state. Mutated only by [`EnergyVad::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// No speech.
    Silence,
    /// Energy above threshold, not yet debounced.
    SpeechStarting,
    /// Confirmed speech.
    Speech,
    /// Energy dropped, waiting out the hangover.
    SpeechEnding,
}

/// Per-frame classification result.
#[derive(Debug, Clone)]
pub enum VadEvent {
    /// Still silent (also returned while a start is being debounced and when
    /// a too-short utterance is discarded).
    SilenceContinue,
    /// Speech confirmed. Carries the pre-roll frames followed by the
    /// debounced trigger frames, in arrival order.
    SpeechStart {
        /// Leading frames of the utterance.
        frames: Vec<AudioFrame>,
    },
    /// The frame belongs to the current utterance.
    SpeechContinue,
    /// The utterance is complete.
    SpeechEnd {
        /// All frames of the utterance, including pre-roll and hangover.
        utterance: Utterance,
        /// Voiced span (trigger to last above-threshold frame) in ms.
        voiced_ms: f64,
    },
}

/// Running counters, useful when tuning thresholds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VadStats {
    /// Frames classified above threshold.
    pub speech_frames: u64,
    /// Frames classified below threshold.
    pub silence_frames: u64,
    /// Utterances that produced a `SpeechEnd`.
    pub utterances: u64,
    /// Utterances dropped for being shorter than the minimum.
    pub discarded: u64,
    /// Highest speech-frame energy seen.
    pub max_speech_energy: f32,
    /// Lowest speech-frame energy seen.
    pub min_speech_energy: f32,
    /// Mean speech-frame energy.
    pub avg_speech_energy: f32,
}

impl VadStats {
    fn record_speech(&mut self, energy: f32) {
        self.speech_frames += 1;
        if self.speech_frames == 1 {
            self.min_speech_energy = energy;
            self.max_speech_energy = energy;
        } else {
            self.min_speech_energy = self.min_speech_energy.min(energy);
            self.max_speech_energy = self.max_speech_energy.max(energy);
        }
        let n = self.speech_frames as f32;
        self.avg_speech_energy += (energy - self.avg_speech_energy) / n;
    }
}

/// Voice activity detector using RMS energy thresholding.
pub struct EnergyVad {
    config: VadConfig,
    state: VadState,
    consecutive_above: u32,
    consecutive_below: u32,
    /// Most recent silent frames, kept for pre-roll.
    pre_roll: VecDeque<AudioFrame>,
    /// Frames of the in-progress utterance.
    utterance: Vec<AudioFrame>,
    /// Voiced span so far, in ms.
    voiced_ms: f64,
    /// Silence since the last above-threshold frame, in ms.
    trailing_ms: f64,
    last_rms: f32,
    stats: VadStats,
}

impl EnergyVad {
    /// Create a detector with the session's thresholds.
    pub fn new(config: &VadConfig) -> Self {
        info!(
            "VAD initialized: threshold={}, start_frames={}, end_frames={}, pre_roll={}, min_utterance={}ms",
            config.energy_threshold,
            config.start_frames,
            config.end_frames,
            config.pre_roll_frames,
            config.min_utterance_ms
        );
        Self {
            config: config.clone(),
            state: VadState::Silence,
            consecutive_above: 0,
            consecutive_below: 0,
            pre_roll: VecDeque::with_capacity(config.pre_roll_frames as usize + 1),
            utterance: Vec::new(),
            voiced_ms: 0.0,
            trailing_ms: 0.0,
            last_rms: 0.0,
            stats: VadStats::default(),
        }
    }

    /// Current state.
    pub fn state(&self) -> VadState {
        self.state
    }

    /// RMS energy of the most recently classified frame.
    pub fn last_rms(&self) -> f32 {
        self.last_rms
    }

    /// Counters since creation.
    pub fn stats(&self) -> &VadStats {
        &self.stats
    }

    /// Classify one frame and advance the state machine.
    pub fn classify(&mut self, frame: &AudioFrame) -> VadEvent {
        let energy = compute_rms_energy(&frame.samples);
        self.last_rms = energy;
        let above = !is_all_zero(&frame.samples) && energy > self.config.energy_threshold;
        if above {
            self.stats.record_speech(energy);
            self.consecutive_above += 1;
            self.consecutive_below = 0;
        } else {
            self.stats.silence_frames += 1;
            self.consecutive_below += 1;
            self.consecutive_above = 0;
        }

        let frame_ms = frame.duration_ms();
        match self.state {
            VadState::Silence => {
                if above {
                    self.state = VadState::SpeechStarting;
                    self.utterance.push(frame.clone());
                    self.voiced_ms = frame_ms;
                    return self.try_confirm_start();
                }
                self.push_pre_roll(frame.clone());
                VadEvent::SilenceContinue
            }
            VadState::SpeechStarting => {
                if above {
                    self.utterance.push(frame.clone());
                    self.voiced_ms += frame_ms;
                    return self.try_confirm_start();
                }
                // Noise spike: the trigger frames become ordinary context.
                let spike = std::mem::take(&mut self.utterance);
                for f in spike {
                    self.push_pre_roll(f);
                }
                self.push_pre_roll(frame.clone());
                self.voiced_ms = 0.0;
                self.state = VadState::Silence;
                VadEvent::SilenceContinue
            }
            VadState::Speech => {
                self.utterance.push(frame.clone());
                if above {
                    self.voiced_ms += frame_ms;
                } else {
                    self.state = VadState::SpeechEnding;
                    self.trailing_ms = frame_ms;
                    if let Some(event) = self.try_end() {
                        return event;
                    }
                }
                VadEvent::SpeechContinue
            }
            VadState::SpeechEnding => {
                self.utterance.push(frame.clone());
                if above {
                    self.voiced_ms += self.trailing_ms + frame_ms;
                    self.trailing_ms = 0.0;
                    self.state = VadState::Speech;
                    return VadEvent::SpeechContinue;
                }
                self.trailing_ms += frame_ms;
                self.try_end().unwrap_or(VadEvent::SpeechContinue)
            }
        }
    }

    /// Drop all buffered audio and return to silence.
    pub fn reset(&mut self) {
        self.state = VadState::Silence;
        self.consecutive_above = 0;
        self.consecutive_below = 0;
        self.pre_roll.clear();
        self.utterance.clear();
        self.voiced_ms = 0.0;
        self.trailing_ms = 0.0;
    }

    fn try_confirm_start(&mut self) -> VadEvent {
        if self.consecutive_above < self.config.start_frames {
            return VadEvent::SilenceContinue;
        }
        self.state = VadState::Speech;
        let mut frames: Vec<AudioFrame> = self.pre_roll.drain(..).collect();
        frames.append(&mut self.utterance);
        self.utterance = frames.clone();
        debug!(
            "speech start confirmed ({} frames incl. pre-roll)",
            frames.len()
        );
        VadEvent::SpeechStart { frames }
    }

    fn try_end(&mut self) -> Option<VadEvent> {
        let hangover_done = self.consecutive_below >= self.config.end_frames;
        let failsafe = self.config.max_silence_ms > 0
            && self.trailing_ms >= f64::from(self.config.max_silence_ms);
        if !hangover_done && !failsafe {
            return None;
        }

        let frames = std::mem::take(&mut self.utterance);
        let voiced_ms = self.voiced_ms;
        self.state = VadState::Silence;
        self.voiced_ms = 0.0;
        self.trailing_ms = 0.0;

        if voiced_ms < f64::from(self.config.min_utterance_ms) {
            self.stats.discarded += 1;
            debug!(
                "discarding {voiced_ms:.0}ms utterance (min {}ms)",
                self.config.min_utterance_ms
            );
            return Some(VadEvent::SilenceContinue);
        }

        self.stats.utterances += 1;
        let started_at = frames
            .first()
            .map(|f| f.received_at)
            .unwrap_or_else(std::time::Instant::now);
        info!("speech segment detected: {voiced_ms:.0}ms voiced");
        Some(VadEvent::SpeechEnd {
            utterance: Utterance { frames, started_at },
            voiced_ms,
        })
    }

    fn push_pre_roll(&mut self, frame: AudioFrame) {
        let cap = self.config.pre_roll_frames as usize;
        if cap == 0 {
            return;
        }
        if self.pre_roll.len() == cap {
            self.pre_roll.pop_front();
        }
        self.pre_roll.push_back(frame);
    }
}

/// Compute RMS energy of audio samples.
pub fn compute_rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

fn is_all_zero(samples: &[f32]) -> bool {
    samples.iter().all(|s| *s == 0.0)
}
