//! External service connectors for a session.

use crate::asr::{HttpAsr, SpeechRecognizer};
use crate::config::SessionConfig;
use crate::error::Result;
use crate::llm::{ApiLlm, LanguageModel};
use crate::tts::{HttpTts, SpeechSynthesizer};
use std::sync::Arc;

/// The ASR, LLM and TTS connectors one session talks to.
pub struct SessionServices {
    /// Per-session recognizer (stateful across an utterance).
    pub recognizer: Box<dyn SpeechRecognizer>,
    /// Streaming language model.
    pub llm: Arc<dyn LanguageModel>,
    /// Speech synthesizer shared by the session's TTS workers.
    pub tts: Arc<dyn SpeechSynthesizer>,
}

/// Builds connectors for each new session.
pub trait ServiceFactory: Send + Sync {
    /// Create connectors for a session with the given (profile-applied) config.
    ///
    /// # Errors
    ///
    /// Returns an error if a connector cannot be configured.
    fn create(&self, config: &SessionConfig) -> Result<SessionServices>;
}

/// Factory for the HTTP connectors configured in [`SessionConfig`].
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpServiceFactory;

impl ServiceFactory for HttpServiceFactory {
    fn create(&self, config: &SessionConfig) -> Result<SessionServices> {
        Ok(SessionServices {
            recognizer: Box::new(HttpAsr::new(&config.asr)?),
            llm: Arc::new(ApiLlm::new(&config.llm)?),
            tts: Arc::new(HttpTts::new(&config.tts)?),
        })
    }
}
