//! WebSocket audio server.
//!
//! Each connection to `/agents/{agent_id}/ws` gets its own
//! [`ConversationSession`]. Binary messages in are little-endian int16 PCM at
//! the configured input rate; binary messages out are int16 PCM chunks of the
//! agent's speech, and text messages out are JSON [`RuntimeEvent`]s plus
//! `truncate` notices on barge-in.

use crate::audio::{FrameAssembler, f32_to_pcm16};
use crate::config::SessionConfig;
use crate::error::{Result, VoiceError};
use crate::pipeline::ConversationSession;
use crate::pipeline::messages::{ChunkPayload, OutboundAudio};
use crate::runtime::RuntimeEvent;
use crate::services::ServiceFactory;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Agent id served from the base configuration when no profile is defined for it.
pub const DEFAULT_AGENT: &str = "default";

/// Inbound frames buffered between the socket reader and the session.
const FRAME_CHANNEL_SIZE: usize = 64;
/// Outbound audio buffered between playback and the socket writer.
const OUTBOUND_CHANNEL_SIZE: usize = 32;
/// Runtime events buffered per connection before the writer lags.
const RUNTIME_EVENT_CAPACITY: usize = 256;

/// One live connection.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Connection / session id.
    pub id: Uuid,
    /// Agent the caller is talking to.
    pub agent_id: String,
    /// When the connection was accepted.
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    cancel: CancellationToken,
}

/// Live sessions keyed by connection id.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, SessionInfo>>>,
}

impl SessionRegistry {
    /// Register a session unless `max` sessions are already live (0 = unlimited).
    pub async fn try_register(
        &self,
        id: Uuid,
        agent_id: &str,
        cancel: CancellationToken,
        max: usize,
    ) -> bool {
        let mut sessions = self.sessions.write().await;
        if max > 0 && sessions.len() >= max {
            return false;
        }
        sessions.insert(
            id,
            SessionInfo {
                id,
                agent_id: agent_id.to_owned(),
                started_at: Utc::now(),
                cancel,
            },
        );
        true
    }

    /// Remove a session; returns it if it was registered.
    pub async fn remove(&self, id: Uuid) -> Option<SessionInfo> {
        self.sessions.write().await.remove(&id)
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no sessions are live.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Snapshot of live sessions, oldest first.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut list: Vec<_> = self.sessions.read().await.values().cloned().collect();
        list.sort_by_key(|s| s.started_at);
        list
    }

    /// Cancel every live session.
    pub async fn shutdown_all(&self) {
        for info in self.sessions.read().await.values() {
            info.cancel.cancel();
        }
    }
}

/// Shared server state.
pub struct AppState {
    config: Arc<SessionConfig>,
    registry: SessionRegistry,
    services: Arc<dyn ServiceFactory>,
}

impl AppState {
    /// Build server state from a base config and a connector factory.
    pub fn new(config: SessionConfig, services: Arc<dyn ServiceFactory>) -> Self {
        Self {
            config: Arc::new(config),
            registry: SessionRegistry::default(),
            services,
        }
    }

    /// Live sessions.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sessions", get(sessions_handler))
        .route("/agents/{agent_id}/ws", get(ws_handler))
        .with_state(state)
}

/// Serve on `listener` until `shutdown` is cancelled. Live sessions are
/// cancelled when shutdown starts.
///
/// # Errors
///
/// Returns [`VoiceError::Transport`] if the server fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("listening on {addr}");
    }
    let registry = state.registry.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("shutting down; closing live sessions");
            registry.shutdown_all().await;
        })
        .await
        .map_err(|e| VoiceError::Transport(format!("server error: {e}")))
}

/// Resolve the effective config for `agent_id`.
///
/// # Errors
///
/// Returns [`VoiceError::Config`] for an unknown agent or an invalid profile.
pub fn resolve_agent_config(base: &SessionConfig, agent_id: &str) -> Result<SessionConfig> {
    if agent_id == DEFAULT_AGENT && !base.agents.contains_key(agent_id) {
        base.validate()?;
        return Ok(base.clone());
    }
    base.for_agent(agent_id)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.registry.len().await,
    }))
}

async fn sessions_handler(State(state): State<Arc<AppState>>) -> Json<Vec<SessionInfo>> {
    Json(state.registry.list().await)
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let config = match resolve_agent_config(&state.config, &agent_id) {
        Ok(config) => config,
        Err(e) => {
            warn!("rejecting connection for agent '{agent_id}': {e}");
            return (StatusCode::NOT_FOUND, e.to_string()).into_response();
        }
    };
    // Early rejection before the upgrade; `try_register` enforces the limit
    // under the registry lock.
    let max = state.config.server.max_sessions;
    if max > 0 && state.registry.len().await >= max {
        return (StatusCode::SERVICE_UNAVAILABLE, "too many sessions").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(state, socket, agent_id, config))
}

async fn handle_socket(
    state: Arc<AppState>,
    mut socket: WebSocket,
    agent_id: String,
    config: SessionConfig,
) {
    let id = Uuid::new_v4();
    let services = match state.services.create(&config) {
        Ok(services) => services,
        Err(e) => {
            warn!(session = %id, "cannot create connectors: {e}");
            reject(&mut socket, "session", &e.to_string()).await;
            return;
        }
    };

    let (runtime_tx, runtime_rx) = broadcast::channel(RUNTIME_EVENT_CAPACITY);
    let session = ConversationSession::new(config.clone(), services)
        .with_id(id)
        .with_runtime_events(runtime_tx.clone());
    let cancel = session.cancel_token();
    if !state
        .registry
        .try_register(id, &agent_id, cancel.clone(), state.config.server.max_sessions)
        .await
    {
        reject(&mut socket, "server", "too many sessions").await;
        return;
    }
    info!(session = %id, agent = %agent_id, "connection accepted");

    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CHANNEL_SIZE);
    let (ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(write_loop(
        ws_tx,
        out_rx,
        runtime_rx,
        config.tts.sample_rate,
    ));
    let mut session_task = tokio::spawn(session.run(frame_rx, out_tx));
    let mut assembler = FrameAssembler::new(&config.audio);

    let mut finished = None;
    let mut reading = true;
    while reading {
        tokio::select! {
            res = &mut session_task => {
                finished = Some(res);
                break;
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Binary(bytes))) => {
                    for frame in assembler.push_pcm16(&bytes) {
                        if frame_tx.send(frame).await.is_err() {
                            reading = false;
                            break;
                        }
                    }
                }
                Some(Ok(Message::Text(_))) => debug!(session = %id, "ignoring text message"),
                Some(Ok(Message::Close(_))) | None => {
                    debug!(session = %id, "client closed");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(session = %id, "websocket error: {e}");
                    break;
                }
            },
        }
    }

    drop(frame_tx);
    let result = match finished {
        Some(res) => res,
        None => session_task.await,
    };
    match result {
        Ok(Ok(summary)) => {
            info!(
                session = %id,
                "session closed after {} utterances ({} frames in)",
                summary.utterances,
                assembler.frames_emitted()
            );
            if let Some(order) = &summary.extracted_order {
                info!(session = %id, %order, "extracted order");
            }
        }
        Ok(Err(e)) => {
            warn!(session = %id, severity = ?e.severity(), "session error: {e}");
            let _ = runtime_tx.send(RuntimeEvent::Error {
                stage: "session".to_owned(),
                message: e.to_string(),
            });
        }
        Err(e) => warn!(session = %id, "session task failed: {e}"),
    }
    drop(runtime_tx);
    let _ = writer.await;
    state.registry.remove(id).await;
}

/// Send an error event and close a socket that never got a session.
async fn reject(socket: &mut WebSocket, stage: &str, message: &str) {
    let event = RuntimeEvent::Error {
        stage: stage.to_owned(),
        message: message.to_owned(),
    };
    if let Ok(json) = serde_json::to_string(&event) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

/// Forward playback audio and runtime events to the client until both close.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<OutboundAudio>,
    mut runtime_rx: broadcast::Receiver<RuntimeEvent>,
    output_sample_rate: u32,
) {
    let mut out_open = true;
    let mut runtime_open = true;
    let mut warned_rate = false;

    while out_open || runtime_open {
        let message = tokio::select! {
            out = out_rx.recv(), if out_open => match out {
                Some(OutboundAudio::Chunk(chunk)) => {
                    let pcm = match chunk.payload {
                        ChunkPayload::Audio { samples, sample_rate } => {
                            if sample_rate != output_sample_rate && !warned_rate {
                                warn!(
                                    "synthesized audio is {sample_rate} Hz, output is {output_sample_rate} Hz"
                                );
                                warned_rate = true;
                            }
                            f32_to_pcm16(&samples)
                        }
                        ChunkPayload::Skipped { gap_ms, .. } => {
                            silence_pcm16(gap_ms, output_sample_rate)
                        }
                    };
                    if pcm.is_empty() {
                        continue;
                    }
                    Message::Binary(pcm.into())
                }
                Some(OutboundAudio::Truncate { sequence_id }) => {
                    let json = serde_json::json!({"type": "truncate", "sequence_id": sequence_id});
                    Message::Text(json.to_string().into())
                }
                None => {
                    out_open = false;
                    continue;
                }
            },
            event = runtime_rx.recv(), if runtime_open => match event {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => Message::Text(json.into()),
                    Err(e) => {
                        warn!("cannot serialize runtime event: {e}");
                        continue;
                    }
                },
                Err(RecvError::Lagged(n)) => {
                    warn!("client lagged; dropped {n} runtime events");
                    continue;
                }
                Err(RecvError::Closed) => {
                    runtime_open = false;
                    continue;
                }
            },
        };
        if ws_tx.send(message).await.is_err() {
            debug!("client went away");
            return;
        }
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}

/// Little-endian int16 silence for `gap_ms` at `sample_rate`.
fn silence_pcm16(gap_ms: u32, sample_rate: u32) -> Vec<u8> {
    let samples = u64::from(gap_ms) * u64::from(sample_rate) / 1000;
    vec![0u8; usize::try_from(samples).unwrap_or(0) * 2]
}
