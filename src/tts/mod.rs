//! Text-to-speech synthesis.
//!
//! [`SpeechSynthesizer`] is the seam to the external TTS service and
//! [`HttpTts`] the default HTTP connector. [`TtsWorkerPool`] runs synthesis
//! calls for a response's chunks with bounded concurrency.

pub mod pool;

pub use pool::TtsWorkerPool;

use crate::audio::decode_wav_mono;
use crate::config::TtsConfig;
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use tracing::debug;

/// Audio returned by one synthesis call.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    /// Mono f32 samples.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

/// External speech synthesis service.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` with the given voice and speed.
    ///
    /// # Errors
    ///
    /// Returns an error if the service call fails or returns unusable audio.
    async fn synthesize(&self, text: &str, voice_id: &str, speed: f32) -> Result<SynthesizedAudio>;
}

/// TTS connector that POSTs JSON and receives a WAV file.
///
/// Request body: `{"text": ..., "voice": ..., "speed": ...}`.
pub struct HttpTts {
    client: reqwest::Client,
    url: String,
}

impl HttpTts {
    /// Create a connector for `config.api_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is empty or the HTTP client cannot be built.
    pub fn new(config: &TtsConfig) -> Result<Self> {
        if config.api_url.trim().is_empty() {
            return Err(VoiceError::Config("tts.api_url is empty".to_owned()));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| VoiceError::Tts(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: config.api_url.trim().to_owned(),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpTts {
    async fn synthesize(&self, text: &str, voice_id: &str, speed: f32) -> Result<SynthesizedAudio> {
        let body = serde_json::json!({
            "text": text,
            "voice": voice_id,
            "speed": speed,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Tts(format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(VoiceError::Tts(format!("service returned {status}: {detail}")));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| VoiceError::Tts(format!("failed to read audio: {e}")))?;
        let (samples, sample_rate) =
            decode_wav_mono(&bytes).map_err(|e| VoiceError::Tts(e.to_string()))?;
        debug!(
            "synthesized {} samples @ {sample_rate}Hz for {} chars",
            samples.len(),
            text.len()
        );
        Ok(SynthesizedAudio {
            samples,
            sample_rate,
        })
    }
}
