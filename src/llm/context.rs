//! Conversation history and prompt assembly.

use crate::config::LlmConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Header placed before injected knowledge text in the system message.
pub const KNOWLEDGE_HEADER: &str = "### KNOWLEDGE BASE ###";

/// Chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Agent instructions.
    System,
    /// The caller.
    User,
    /// The agent.
    Assistant,
}

/// A single message sent to the language model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    /// Author.
    pub role: Role,
    /// Text content.
    pub content: String,
}

/// Full prompt for one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prompt {
    /// Messages in order: system, history, new user turn.
    pub messages: Vec<ChatMessage>,
}

impl Prompt {
    /// Assemble system prompt + knowledge + history + new transcript.
    pub fn build(config: &LlmConfig, history: &ConversationHistory, transcript: &str) -> Self {
        let mut messages = Vec::with_capacity(history.len() + 2);
        let system = system_content(&config.system_prompt, &config.knowledge);
        if !system.is_empty() {
            messages.push(ChatMessage {
                role: Role::System,
                content: system,
            });
        }
        messages.extend(history.entries().iter().map(HistoryEntry::to_message));
        messages.push(ChatMessage {
            role: Role::User,
            content: transcript.trim().to_owned(),
        });
        Self { messages }
    }
}

/// Combine the system prompt with knowledge text.
pub fn system_content(system_prompt: &str, knowledge: &str) -> String {
    let mut content = system_prompt.trim().to_owned();
    let knowledge = knowledge.trim();
    if !knowledge.is_empty() {
        if !content.is_empty() {
            content.push_str("\n\n");
        }
        content.push_str(KNOWLEDGE_HEADER);
        content.push('\n');
        content.push_str(knowledge);
    }
    content
}

/// One user or agent turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    /// User or assistant.
    pub role: Role,
    /// What was said (for an interrupted agent turn, what was played).
    pub text: String,
    /// The agent was cut off by barge-in.
    pub interrupted: bool,
    /// When the entry was recorded.
    pub at: DateTime<Utc>,
}

impl HistoryEntry {
    fn to_message(&self) -> ChatMessage {
        let content = if self.interrupted {
            if self.text.trim().is_empty() {
                "[interrupted]".to_owned()
            } else {
                format!("{} [interrupted]", self.text.trim())
            }
        } else {
            self.text.clone()
        };
        ChatMessage {
            role: self.role,
            content,
        }
    }
}

/// Ordered user/agent turns for the lifetime of a session.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    entries: Vec<HistoryEntry>,
    max_messages: usize,
}

impl ConversationHistory {
    /// Create an empty history keeping at most `max_messages` entries (0 = unbounded).
    pub fn new(max_messages: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_messages,
        }
    }

    /// Record a final user transcript.
    pub fn push_user(&mut self, text: &str) {
        self.push(Role::User, text, false);
    }

    /// Record a completed agent response.
    pub fn push_agent(&mut self, text: &str) {
        self.push(Role::Assistant, text, false);
    }

    /// Record an agent turn cut off by barge-in. `spoken` may be empty.
    pub fn push_agent_interrupted(&mut self, spoken: &str) {
        self.push(Role::Assistant, spoken, true);
    }

    /// All retained entries, oldest first.
    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been said yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent entry.
    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    fn push(&mut self, role: Role, text: &str, interrupted: bool) {
        self.entries.push(HistoryEntry {
            role,
            text: text.trim().to_owned(),
            interrupted,
            at: Utc::now(),
        });
        self.trim();
    }

    fn trim(&mut self) {
        if self.max_messages == 0 {
            return;
        }
        if self.entries.len() > self.max_messages {
            let excess = self.entries.len() - self.max_messages;
            self.entries.drain(..excess);
        }
    }
}
