//! OpenAI-compatible API backend for LLM inference.
//!
//! Supports any server implementing the OpenAI chat completions API:
//! - Ollama (`http://localhost:11434`)
//! - MLX server (`http://localhost:8080`)
//! - vLLM, llama.cpp server, etc.

use super::LanguageModel;
use super::context::Prompt;
use crate::config::LlmConfig;
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Buffered tokens between the HTTP reader and the generator.
const TOKEN_CHANNEL_SIZE: usize = 64;

/// LLM backend using an OpenAI-compatible HTTP API.
///
/// Streams responses via Server-Sent Events (SSE). Each call to
/// [`LanguageModel::stream`] spawns a reader task that forwards content
/// deltas until `[DONE]`, a stop finish reason, or the receiver is dropped.
pub struct ApiLlm {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
    temperature: f64,
    top_p: f64,
    max_tokens: usize,
}

impl ApiLlm {
    /// Create a new API-based LLM client.
    ///
    /// # Errors
    ///
    /// Returns an error if `api_url` or `api_model` is empty or the HTTP
    /// client cannot be built.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        if config.api_url.trim().is_empty() {
            return Err(VoiceError::Config("llm.api_url is empty".to_owned()));
        }
        if config.api_model.trim().is_empty() {
            return Err(VoiceError::Config("llm.api_model is empty".to_owned()));
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| VoiceError::Llm(format!("failed to build HTTP client: {e}")))?;
        let url = completions_url(&config.api_url);

        info!("API LLM configured: {url} model={}", config.api_model);

        Ok(Self {
            client,
            url,
            model: config.api_model.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
        })
    }

    fn request_body(&self, prompt: &Prompt) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": prompt.messages,
            "stream": true,
            "temperature": self.temperature,
            "top_p": self.top_p,
            "max_tokens": self.max_tokens,
        })
    }
}

#[async_trait]
impl LanguageModel for ApiLlm {
    async fn stream(&self, prompt: &Prompt) -> Result<mpsc::Receiver<Result<String>>> {
        let mut req = self.client.post(&self.url).json(&self.request_body(prompt));
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| VoiceError::Llm(format!("API request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Llm(format!("API returned {status}: {body}")));
        }

        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_SIZE);
        tokio::spawn(forward_sse(response, tx));
        Ok(rx)
    }
}

/// Read SSE lines from `response` and forward content deltas to `tx`.
///
/// Returns as soon as the receiver is dropped, even while the server is
/// silent, which closes the HTTP connection.
async fn forward_sse(response: reqwest::Response, tx: mpsc::Sender<Result<String>>) {
    let mut body = response.bytes_stream();
    let mut lines = SseLineBuffer::default();
    let mut token_count: usize = 0;

    loop {
        let next = tokio::select! {
            biased;
            () = tx.closed() => {
                debug!("token receiver dropped after {token_count} tokens, closing LLM stream");
                return;
            }
            next = body.next() => match next {
                Some(next) => next,
                None => break,
            },
        };
        let bytes = match next {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("LLM stream read error after {token_count} tokens: {e}");
                let _ = tx
                    .send(Err(VoiceError::Llm(format!("stream read error: {e}"))))
                    .await;
                return;
            }
        };

        for line in lines.push(&bytes) {
            let event = match parse_sse_line(&line) {
                Ok(event) => event,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            if let Some(token) = event.token {
                token_count += 1;
                if tx.send(Ok(token)).await.is_err() {
                    debug!("token receiver dropped after {token_count} tokens, closing LLM stream");
                    return;
                }
            }
            if event.done {
                debug!("LLM stream finished: {token_count} tokens");
                return;
            }
        }
    }
    debug!("LLM stream closed by server: {token_count} tokens");
}

/// One parsed SSE `data:` line.
#[derive(Debug, Default, PartialEq, Eq)]
struct SseEvent {
    token: Option<String>,
    done: bool,
}

fn parse_sse_line(line: &str) -> Result<SseEvent> {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Ok(SseEvent::default());
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Ok(SseEvent {
            token: None,
            done: true,
        });
    }

    let chunk: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| VoiceError::Llm(format!("JSON parse error: {e}")))?;
    if let Some(err) = chunk.get("error") {
        return Err(VoiceError::Llm(format!("API stream error: {err}")));
    }

    let choice = &chunk["choices"][0];
    let token = choice["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_owned);
    let done = choice["finish_reason"].as_str() == Some("stop");
    Ok(SseEvent { token, done })
}

/// Splits a byte stream into text lines, holding partial lines (and split
/// UTF-8 sequences) until their newline arrives.
#[derive(Debug, Default)]
struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(nl) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=nl).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                lines.push(line.to_owned());
            }
        }
        lines
    }
}

/// Normalize a base URL (with or without `/v1`) to the completions endpoint.
fn completions_url(api_url: &str) -> String {
    let base = api_url.trim().trim_end_matches('/');
    let base = base.strip_suffix("/v1").unwrap_or(base);
    format!("{base}/v1/chat/completions")
}
