//! Speech recognition.
//!
//! [`SpeechRecognizer`] is the seam to the external ASR service. The ASR
//! stage feeds it the frames of each utterance and asks for a final
//! transcript when the VAD reports the end of speech.

use crate::audio::encode_wav_pcm16;
use crate::config::AsrConfig;
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::{AudioFrame, ControlEvent, Transcription};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// External speech recognition service, one instance per session.
#[async_trait]
pub trait SpeechRecognizer: Send {
    /// Discard buffered audio and start a new utterance.
    fn reset(&mut self);

    /// Add one frame of the current utterance.
    ///
    /// # Errors
    ///
    /// Returns an error if the service rejects the audio.
    async fn submit(&mut self, frame: &AudioFrame) -> Result<()>;

    /// Close the utterance and return the final transcript.
    ///
    /// # Errors
    ///
    /// Returns an error if transcription fails.
    async fn finalize(&mut self) -> Result<String>;

    /// Interim transcript of the current utterance, for recognizers that
    /// stream. Batch recognizers have none.
    fn partial(&mut self) -> Option<String> {
        None
    }
}

/// ASR connector that POSTs each utterance as a 16-bit WAV file.
///
/// The service answers with JSON carrying `text` (or `transcript`).
pub struct HttpAsr {
    client: reqwest::Client,
    url: String,
    api_key: String,
    samples: Vec<f32>,
    sample_rate: u32,
}

impl HttpAsr {
    /// Create a connector for `config.api_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is empty or the HTTP client cannot be built.
    pub fn new(config: &AsrConfig) -> Result<Self> {
        if config.api_url.trim().is_empty() {
            return Err(VoiceError::Config("asr.api_url is empty".to_owned()));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| VoiceError::Asr(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: config.api_url.trim().to_owned(),
            api_key: config.api_key.clone(),
            samples: Vec::new(),
            sample_rate: 0,
        })
    }
}

#[async_trait]
impl SpeechRecognizer for HttpAsr {
    fn reset(&mut self) {
        self.samples.clear();
    }

    async fn submit(&mut self, frame: &AudioFrame) -> Result<()> {
        if self.sample_rate != 0 && frame.sample_rate != self.sample_rate {
            return Err(VoiceError::Asr(format!(
                "sample rate changed mid-session: {} -> {}",
                self.sample_rate, frame.sample_rate
            )));
        }
        self.sample_rate = frame.sample_rate;
        self.samples.extend_from_slice(&frame.samples);
        Ok(())
    }

    async fn finalize(&mut self) -> Result<String> {
        let samples = std::mem::take(&mut self.samples);
        if samples.is_empty() {
            return Ok(String::new());
        }
        let wav = encode_wav_pcm16(&samples, self.sample_rate)?;

        let mut req = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "audio/wav")
            .body(wav);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        let response = req
            .send()
            .await
            .map_err(|e| VoiceError::Asr(format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(VoiceError::Asr(format!("service returned {status}: {detail}")));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| VoiceError::Asr(format!("invalid response: {e}")))?;
        let text = body
            .get("text")
            .or_else(|| body.get("transcript"))
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| VoiceError::Asr("response has no text field".to_owned()))?;
        Ok(text.trim().to_owned())
    }
}

/// Commands from the session loop to the ASR stage.
#[derive(Debug)]
pub(crate) enum AsrCommand {
    /// A new utterance begins.
    Begin { utterance_id: u64 },
    /// Frames of the current utterance.
    Frames(Vec<AudioFrame>),
    /// The utterance was too short and is dropped.
    Abort,
    /// End of speech; produce the final transcript.
    Finalize {
        utterance_id: u64,
        started_at: Instant,
    },
}

/// Run the ASR stage until the session is cancelled or its input closes.
///
/// Every `Finalize` produces exactly one [`ControlEvent`]: a transcript or a
/// failure. The input is unbounded so a slow `finalize` queues frames here
/// instead of stalling the session loop.
pub(crate) async fn run_asr_stage(
    mut recognizer: Box<dyn SpeechRecognizer>,
    config: AsrConfig,
    mut rx: mpsc::UnboundedReceiver<AsrCommand>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    cancel: CancellationToken,
) {
    let finalize_timeout = Duration::from_millis(config.finalize_timeout_ms);
    let mut active: Option<u64> = None;
    let mut submit_failed = false;
    let mut last_partial = String::new();

    loop {
        let cmd = tokio::select! {
            () = cancel.cancelled() => break,
            cmd = rx.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
        };

        match cmd {
            AsrCommand::Begin { utterance_id } => {
                recognizer.reset();
                active = Some(utterance_id);
                submit_failed = false;
                last_partial.clear();
            }
            AsrCommand::Frames(frames) => {
                let Some(utterance_id) = active.filter(|_| !submit_failed) else {
                    continue;
                };
                for frame in &frames {
                    if let Err(e) = recognizer.submit(frame).await {
                        warn!("ASR submit failed: {e}");
                        submit_failed = true;
                        break;
                    }
                }
                if let Some(text) = recognizer.partial().filter(|t| *t != last_partial) {
                    last_partial.clone_from(&text);
                    if control_tx
                        .send(ControlEvent::PartialTranscript { utterance_id, text })
                        .is_err()
                    {
                        break;
                    }
                }
            }
            AsrCommand::Abort => {
                if let Some(id) = active.take() {
                    debug!("utterance {id} dropped before transcription");
                }
                recognizer.reset();
            }
            AsrCommand::Finalize {
                utterance_id,
                started_at,
            } => {
                if active.take() != Some(utterance_id) {
                    debug!("finalize for unknown utterance {utterance_id}");
                    continue;
                }
                let event = if submit_failed {
                    recognizer.reset();
                    ControlEvent::AsrFailed {
                        utterance_id,
                        error: VoiceError::Asr("audio submission failed".to_owned()),
                    }
                } else {
                    let result = tokio::select! {
                        () = cancel.cancelled() => break,
                        r = tokio::time::timeout(finalize_timeout, recognizer.finalize()) => r,
                    };
                    match result {
                        Ok(Ok(text)) => {
                            info!("utterance {utterance_id} transcribed: \"{text}\"");
                            ControlEvent::Transcript(Transcription {
                                utterance_id,
                                text,
                                audio_started_at: started_at,
                                transcribed_at: Instant::now(),
                            })
                        }
                        Ok(Err(error)) => ControlEvent::AsrFailed { utterance_id, error },
                        Err(_) => {
                            recognizer.reset();
                            ControlEvent::AsrFailed {
                                utterance_id,
                                error: VoiceError::Timeout {
                                    stage: "asr",
                                    millis: config.finalize_timeout_ms,
                                },
                            }
                        }
                    }
                };
                if control_tx.send(event).is_err() {
                    break;
                }
            }
        }
    }
}
