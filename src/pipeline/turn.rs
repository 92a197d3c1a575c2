//! Turn-taking state machine.
//!
//! ```text
//! LISTENING --final transcript--> THINKING --first audio--> SPEAKING
//!     ^                               |                        |
//!     +-------- response complete ----+------------------------+
//!     |                                                        |
//!     +---- interruption handled ---- INTERRUPTED <-- user speech (barge-in)
//! ```
//!
//! Any state may move to TERMINATED. The coordinator only decides; the
//! session performs the side effects (cancellation, history updates).

use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

/// Conversational turn state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// Waiting for the user to say something.
    Listening,
    /// A response is being generated; nothing played yet.
    Thinking,
    /// Response audio is being played.
    Speaking,
    /// The user barged in; the response is being torn down.
    Interrupted,
    /// The session is over.
    Terminated,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Listening => "LISTENING",
            Self::Thinking => "THINKING",
            Self::Speaking => "SPEAKING",
            Self::Interrupted => "INTERRUPTED",
            Self::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

/// A state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnTransition {
    /// State before.
    pub from: TurnState,
    /// State after.
    pub to: TurnState,
}

/// What the session should do about a confirmed speech start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechStartAction {
    /// Keep going; no turn change.
    Continue,
    /// Cancel the live response (state is now INTERRUPTED).
    BargeIn,
}

/// Owns the turn state and rejects edges the machine does not have.
#[derive(Debug)]
pub struct TurnCoordinator {
    state: TurnState,
    barge_in: bool,
}

impl TurnCoordinator {
    /// Start in LISTENING.
    pub fn new(barge_in: bool) -> Self {
        Self {
            state: TurnState::Listening,
            barge_in,
        }
    }

    /// Current state.
    pub fn state(&self) -> TurnState {
        self.state
    }

    /// The VAD confirmed user speech.
    pub fn on_speech_start(&mut self) -> (SpeechStartAction, Option<TurnTransition>) {
        if self.state == TurnState::Speaking && self.barge_in {
            let t = self.transition(TurnState::Interrupted);
            return (SpeechStartAction::BargeIn, t);
        }
        (SpeechStartAction::Continue, None)
    }

    /// A final transcript arrived. Returns the transition if a response should start.
    pub fn on_final_transcript(&mut self) -> Option<TurnTransition> {
        if self.state != TurnState::Listening {
            debug!("transcript ignored in {}", self.state);
            return None;
        }
        self.transition(TurnState::Thinking)
    }

    /// The first chunk of the live response was played.
    pub fn on_playback_started(&mut self) -> Option<TurnTransition> {
        if self.state != TurnState::Thinking {
            return None;
        }
        self.transition(TurnState::Speaking)
    }

    /// The live response finished (played out, empty, or failed).
    pub fn on_response_complete(&mut self) -> Option<TurnTransition> {
        match self.state {
            TurnState::Thinking | TurnState::Speaking => self.transition(TurnState::Listening),
            _ => None,
        }
    }

    /// Barge-in cleanup is done.
    pub fn on_interruption_handled(&mut self) -> Option<TurnTransition> {
        if self.state != TurnState::Interrupted {
            return None;
        }
        self.transition(TurnState::Listening)
    }

    /// The session is ending.
    pub fn terminate(&mut self) -> Option<TurnTransition> {
        self.transition(TurnState::Terminated)
    }

    fn transition(&mut self, to: TurnState) -> Option<TurnTransition> {
        if !is_allowed(self.state, to) {
            warn!("rejected turn transition {} -> {to}", self.state);
            return None;
        }
        let t = TurnTransition {
            from: self.state,
            to,
        };
        debug!("turn {} -> {}", t.from, t.to);
        self.state = to;
        Some(t)
    }
}

fn is_allowed(from: TurnState, to: TurnState) -> bool {
    use TurnState::{Interrupted, Listening, Speaking, Terminated, Thinking};
    matches!(
        (from, to),
        (Listening, Thinking)
            | (Thinking, Speaking)
            | (Thinking, Listening)
            | (Speaking, Listening)
            | (Speaking, Interrupted)
            | (Interrupted, Listening)
    ) || (to == Terminated && from != Terminated)
}
