//! Configuration types for a conversation session.
//!
//! A [`SessionConfig`] is assembled once when a connection is established
//! (base file + optional [`AgentProfile`]) and is immutable for the lifetime
//! of the session.

use crate::error::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration for the voice pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Audio frame format on the transport.
    pub audio: AudioConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Speech recognition service settings.
    pub asr: AsrConfig,
    /// Language model service settings.
    pub llm: LlmConfig,
    /// Sentence chunking settings.
    pub chunker: ChunkerConfig,
    /// Text-to-speech service and worker pool settings.
    pub tts: TtsConfig,
    /// Turn-taking behaviour.
    pub conversation: ConversationConfig,
    /// WebSocket server settings.
    pub server: ServerConfig,
    /// Agent profiles keyed by agent id.
    pub agents: BTreeMap<String, AgentProfile>,
}

/// Audio frame format, fixed per session at connection time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Inbound sample rate in Hz.
    pub input_sample_rate: u32,
    /// Duration of one inbound frame in ms.
    pub frame_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            frame_ms: 20,
        }
    }
}

impl AudioConfig {
    /// Number of samples in one inbound frame.
    pub fn frame_samples(&self) -> usize {
        (self.input_sample_rate as usize * self.frame_ms as usize) / 1000
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS energy threshold for speech detection.
    ///
    /// Typical values for f32 samples in \[-1, 1\]:
    ///   - 0.005: very sensitive
    ///   - 0.01:  normal sensitivity (default)
    ///   - 0.02:  noisy environments
    pub energy_threshold: f32,
    /// Consecutive above-threshold frames required to confirm speech start.
    pub start_frames: u32,
    /// Consecutive below-threshold frames (hangover) required to end speech.
    pub end_frames: u32,
    /// Frames retained from before the trigger and prepended to the utterance.
    pub pre_roll_frames: u32,
    /// Utterances shorter than this are discarded as noise.
    pub min_utterance_ms: u32,
    /// Failsafe: force speech end after this much continuous silence.
    pub max_silence_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.01,
            start_frames: 3,
            end_frames: 25,
            pre_roll_frames: 15,
            min_utterance_ms: 250,
            max_silence_ms: 10_000,
        }
    }
}

/// Speech recognition service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    /// Transcription endpoint accepting a WAV body.
    pub api_url: String,
    /// Bearer token (empty for local servers).
    pub api_key: String,
    /// Deadline for `finalize()` in ms.
    pub finalize_timeout_ms: u64,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8002/v1/transcribe".to_owned(),
            api_key: String::new(),
            finalize_timeout_ms: 5_000,
        }
    }
}

/// Language model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible server.
    pub api_url: String,
    /// Model name to request.
    pub api_model: String,
    /// Bearer token (empty for local servers).
    pub api_key: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Top-p (nucleus) sampling threshold.
    pub top_p: f64,
    /// Maximum tokens to generate per response.
    pub max_tokens: usize,
    /// Maximum number of history messages retained (0 disables trimming).
    pub max_history_messages: usize,
    /// Abort the response if no token arrives for this long (ms).
    pub stall_timeout_ms: u64,
    /// Agent system prompt.
    pub system_prompt: String,
    /// Injected knowledge text appended to the system prompt.
    pub knowledge: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:11434".to_owned(),
            api_model: "smollm2:1.7b".to_owned(),
            api_key: String::new(),
            temperature: 0.15,
            top_p: 0.9,
            max_tokens: 1024,
            max_history_messages: 24,
            stall_timeout_ms: 10_000,
            system_prompt: String::new(),
            knowledge: String::new(),
        }
    }
}

/// Sentence chunker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Force a chunk after this many characters without terminal punctuation.
    pub max_chunk_chars: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 200,
        }
    }
}

/// What to do when synthesis of a chunk fails.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsFailurePolicy {
    /// Substitute a silence gap for the chunk.
    #[default]
    Skip,
    /// Retry once after `retry_backoff_ms`, then skip.
    RetryOnce,
}

/// What happens to synthesis calls already running when a sequence is cancelled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerCancelMode {
    /// Drop the in-flight call immediately.
    #[default]
    Abandon,
    /// Let the call finish; its output is discarded.
    Drain,
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Synthesis endpoint accepting `{text, voice, speed}`.
    pub api_url: String,
    /// Voice identity.
    pub voice_id: String,
    /// Speaking speed multiplier.
    pub speed: f32,
    /// Expected output sample rate in Hz.
    pub sample_rate: u32,
    /// Maximum concurrent synthesis calls per session.
    pub pool_size: usize,
    /// Deadline for a single synthesis call in ms.
    pub synth_timeout_ms: u64,
    /// Failure handling for a single chunk.
    pub failure_policy: TtsFailurePolicy,
    /// Delay before the retry under [`TtsFailurePolicy::RetryOnce`].
    pub retry_backoff_ms: u64,
    /// Behaviour of running workers on cancellation.
    pub cancel_mode: WorkerCancelMode,
    /// Length of the silence substituted for a skipped chunk.
    pub skip_gap_ms: u32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8001/synthesize".to_owned(),
            voice_id: "af_heart".to_owned(),
            speed: 1.0,
            sample_rate: 24_000,
            pool_size: 3,
            synth_timeout_ms: 8_000,
            failure_policy: TtsFailurePolicy::default(),
            retry_backoff_ms: 200,
            cancel_mode: WorkerCancelMode::default(),
            skip_gap_ms: 150,
        }
    }
}

/// Turn-taking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Whether user speech interrupts the agent while it is speaking.
    pub barge_in: bool,
    /// Phrases in an agent response that mark the conversation as finished.
    pub closing_phrases: Vec<String>,
    /// Ask the model for a structured order once the conversation finishes.
    pub extract_order: bool,
    /// Instruction appended to the history for order extraction.
    pub extraction_prompt: String,
    /// Upper bound on the extraction call.
    pub extraction_timeout_ms: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            barge_in: true,
            closing_phrases: vec![
                "thank you for your order".to_owned(),
                "your order is confirmed".to_owned(),
                "goodbye".to_owned(),
            ],
            extract_order: false,
            extraction_prompt: crate::llm::extract::DEFAULT_EXTRACTION_PROMPT.to_owned(),
            extraction_timeout_ms: 15_000,
        }
    }
}

/// WebSocket server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub bind: String,
    /// Maximum concurrent sessions (0 = unlimited).
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8090".to_owned(),
            max_sessions: 64,
        }
    }
}

/// Per-agent overrides read from the agent's persisted profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentProfile {
    /// Voice identity for synthesis.
    pub voice_id: Option<String>,
    /// Speaking speed multiplier.
    pub speed: Option<f32>,
    /// Minimum silence (ms) that ends a user utterance.
    pub min_silence_ms: Option<u32>,
    /// VAD energy threshold.
    pub energy_threshold: Option<f32>,
    /// System prompt.
    pub system_prompt: String,
    /// Knowledge text injected after the system prompt.
    pub knowledge: String,
}

impl SessionConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| VoiceError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| VoiceError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> PathBuf {
        crate::parley_dirs::config_file()
    }

    /// Build the effective config for one session of the given agent.
    ///
    /// Profile fields that are set override the base configuration. The
    /// minimum silence is converted to a hangover frame count.
    pub fn with_profile(&self, profile: &AgentProfile) -> Self {
        let mut config = self.clone();
        if let Some(voice) = &profile.voice_id {
            config.tts.voice_id = voice.clone();
        }
        if let Some(speed) = profile.speed {
            config.tts.speed = speed;
        }
        if let Some(threshold) = profile.energy_threshold {
            config.vad.energy_threshold = threshold;
        }
        if let Some(ms) = profile.min_silence_ms {
            let frame_ms = config.audio.frame_ms.max(1);
            config.vad.end_frames = ms.div_ceil(frame_ms).max(1);
        }
        if !profile.system_prompt.trim().is_empty() {
            config.llm.system_prompt = profile.system_prompt.clone();
        }
        if !profile.knowledge.trim().is_empty() {
            config.llm.knowledge = profile.knowledge.clone();
        }
        config
    }

    /// Look up an agent profile and build its session config.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Config`] if the agent is unknown.
    pub fn for_agent(&self, agent_id: &str) -> Result<Self> {
        let profile = self
            .agents
            .get(agent_id)
            .ok_or_else(|| VoiceError::Config(format!("unknown agent '{agent_id}'")))?;
        let config = self.with_profile(profile);
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        fn bad(msg: &str) -> Result<()> {
            Err(VoiceError::Config(msg.to_owned()))
        }
        if self.audio.input_sample_rate == 0 || self.audio.frame_ms == 0 {
            return bad("audio.input_sample_rate and audio.frame_ms must be positive");
        }
        if self.audio.frame_samples() == 0 {
            return bad("audio frame must contain at least one sample");
        }
        if !self.vad.energy_threshold.is_finite() || self.vad.energy_threshold <= 0.0 {
            return bad("vad.energy_threshold must be a positive number");
        }
        if self.vad.start_frames == 0 || self.vad.end_frames == 0 {
            return bad("vad.start_frames and vad.end_frames must be at least 1");
        }
        if self.chunker.max_chunk_chars == 0 {
            return bad("chunker.max_chunk_chars must be at least 1");
        }
        if self.tts.pool_size == 0 {
            return bad("tts.pool_size must be at least 1");
        }
        if !self.tts.speed.is_finite() || self.tts.speed <= 0.0 {
            return bad("tts.speed must be a positive number");
        }
        if self.tts.sample_rate == 0 {
            return bad("tts.sample_rate must be positive");
        }
        if self.tts.voice_id.trim().is_empty() {
            return bad("tts.voice_id must not be empty");
        }
        if self.conversation.extract_order && self.conversation.extraction_prompt.trim().is_empty() {
            return bad("conversation.extraction_prompt must not be empty when extract_order is set");
        }
        Ok(())
    }
}
