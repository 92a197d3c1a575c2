//! Conversation pipeline: message types, turn state machine and the
//! per-connection session loop.

pub mod messages;
pub mod session;
pub mod turn;

pub use session::{ConversationSession, SessionSummary};
pub use turn::{TurnCoordinator, TurnState};
