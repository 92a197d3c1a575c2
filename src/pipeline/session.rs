//! One conversation over one audio connection.
//!
//! A [`ConversationSession`] owns every piece of per-conversation state: VAD,
//! turn state, history and the live response. It runs a single event loop
//! over inbound frames and stage events, so the turn state has exactly one
//! writer. Stage tasks:
//!
//! ```text
//! frames ─▶ VAD ─▶ ASR stage ──transcript──▶ session loop
//!                                               │ start response
//!                         ResponseGenerator ◀───┘
//!                               │ TextChunk
//!                         TtsWorkerPool (bounded)
//!                               │ AudioChunk (any order)
//!                         playback stage (sequencer) ─▶ outbound transport
//! ```
//!
//! Every response gets a fresh sequence id and cancellation token. Barge-in
//! cancels the token before anything else happens, which stops the
//! generator, the dispatcher and playback emission.

use crate::asr::{AsrCommand, run_asr_stage};
use crate::config::SessionConfig;
use crate::error::{Result, VoiceError};
use crate::llm::context::{ConversationHistory, HistoryEntry, Prompt};
use crate::llm::{
    GenerationOutcome, GenerationSummary, LanguageModel, ResponseGenerator, ResponseStream,
    extract_order,
};
use crate::pipeline::messages::{AudioFrame, ControlEvent, OutboundAudio, SequenceId, Transcription};
use crate::pipeline::turn::{SpeechStartAction, TurnCoordinator, TurnTransition};
use crate::playback::{PlaybackInput, PlaybackStageControl, run_playback_stage};
use crate::runtime::RuntimeEvent;
use crate::services::SessionServices;
use crate::tts::TtsWorkerPool;
use crate::vad::{EnergyVad, VadEvent, VadState, VadStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Buffered inputs for the playback stage.
const PLAYBACK_CHANNEL_SIZE: usize = 32;

/// What happened during a session, returned when it ends.
#[derive(Debug, Clone, Default)]
pub struct SessionSummary {
    /// Utterances handed to ASR.
    pub utterances: u64,
    /// Responses that ran to completion (including failed ones).
    pub responses: u64,
    /// Responses cut off by the user.
    pub barge_ins: u64,
    /// An agent response contained a closing phrase.
    pub conversation_finished: bool,
    /// Structured order pulled from the finished conversation, if enabled.
    pub extracted_order: Option<serde_json::Value>,
    /// Conversation history at the end of the session.
    pub history: Vec<HistoryEntry>,
    /// VAD counters.
    pub vad: VadStats,
}

/// A full-duplex voice conversation.
pub struct ConversationSession {
    id: Uuid,
    config: SessionConfig,
    services: SessionServices,
    cancel: CancellationToken,
    runtime_tx: Option<broadcast::Sender<RuntimeEvent>>,
}

impl ConversationSession {
    /// Create a session. `config` should already have the agent profile applied.
    pub fn new(config: SessionConfig, services: SessionServices) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            services,
            cancel: CancellationToken::new(),
            runtime_tx: None,
        }
    }

    /// Use a caller-chosen session id (e.g. the connection id).
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Publish [`RuntimeEvent`]s to `tx`.
    pub fn with_runtime_events(mut self, tx: broadcast::Sender<RuntimeEvent>) -> Self {
        self.runtime_tx = Some(tx);
        self
    }

    /// Session id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Token that ends the session when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask the session to end.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run until the inbound audio closes, the session is cancelled, or the
    /// conversation finishes.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a stage task
    /// stops unexpectedly.
    pub async fn run(
        self,
        mut frames: mpsc::Receiver<AudioFrame>,
        outbound: mpsc::Sender<OutboundAudio>,
    ) -> Result<SessionSummary> {
        let Self {
            id,
            config,
            services,
            cancel,
            runtime_tx,
        } = self;
        config.validate()?;
        info!(session = %id, "session started");

        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        // Unbounded: the loop must never wait on a slow transcription.
        let (asr_tx, asr_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::channel(PLAYBACK_CHANNEL_SIZE);
        let stages = cancel.child_token();

        let asr_handle = tokio::spawn(run_asr_stage(
            services.recognizer,
            config.asr.clone(),
            asr_rx,
            control_tx.clone(),
            stages.clone(),
        ));
        let playback_handle = tokio::spawn(run_playback_stage(
            playback_rx,
            PlaybackStageControl {
                out: outbound,
                control_tx: control_tx.clone(),
                cancel: stages.clone(),
            },
        ));

        let mut state = SessionLoop {
            id,
            llm: Arc::clone(&services.llm),
            vad: EnergyVad::new(&config.vad),
            turn: TurnCoordinator::new(config.conversation.barge_in),
            history: ConversationHistory::new(config.llm.max_history_messages),
            generator: ResponseGenerator::new(services.llm, &config.llm, &config.chunker),
            pool: TtsWorkerPool::new(services.tts, &config.tts),
            config,
            asr_tx,
            playback_tx,
            control_tx,
            runtime_tx,
            cancel,
            next_utterance_id: 0,
            utterance: None,
            next_sequence_id: 0,
            live: None,
            summary: SessionSummary::default(),
            finished: false,
        };

        let result = state.run_loop(&mut frames, &mut control_rx).await;
        if result.is_ok() && state.finished && state.config.conversation.extract_order {
            state.run_order_extraction().await;
        }
        state.close();
        stages.cancel();
        let _ = asr_handle.await;
        let _ = playback_handle.await;

        match &result {
            Ok(()) => info!(
                session = %id,
                "session ended: {} utterances, {} responses, {} barge-ins",
                state.summary.utterances, state.summary.responses, state.summary.barge_ins
            ),
            Err(e) => warn!(session = %id, "session failed: {e}"),
        }
        result.map(|()| state.into_summary())
    }
}

/// The response currently owned by the session.
struct LiveResponse {
    sequence_id: SequenceId,
    token: CancellationToken,
    /// Text of chunks that reached the transport.
    spoken: Vec<String>,
    generation: Option<GenerationSummary>,
    playback_done: bool,
}

struct SessionLoop {
    id: Uuid,
    llm: Arc<dyn LanguageModel>,
    config: SessionConfig,
    vad: EnergyVad,
    turn: TurnCoordinator,
    history: ConversationHistory,
    generator: ResponseGenerator,
    pool: TtsWorkerPool,
    asr_tx: mpsc::UnboundedSender<AsrCommand>,
    playback_tx: mpsc::Sender<PlaybackInput>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    runtime_tx: Option<broadcast::Sender<RuntimeEvent>>,
    cancel: CancellationToken,
    next_utterance_id: u64,
    utterance: Option<u64>,
    next_sequence_id: SequenceId,
    live: Option<LiveResponse>,
    summary: SessionSummary,
    finished: bool,
}

impl SessionLoop {
    async fn run_loop(
        &mut self,
        frames: &mut mpsc::Receiver<AudioFrame>,
        control_rx: &mut mpsc::UnboundedReceiver<ControlEvent>,
    ) -> Result<()> {
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!(session = %self.id, "session cancelled");
                    return Ok(());
                }
                Some(event) = control_rx.recv() => self.on_control(event).await?,
                frame = frames.recv() => match frame {
                    Some(frame) => self.on_frame(frame).await?,
                    None => {
                        info!(session = %self.id, "inbound audio closed");
                        return Ok(());
                    }
                },
            }
            if self.finished {
                return Ok(());
            }
        }
    }

    async fn on_frame(&mut self, frame: AudioFrame) -> Result<()> {
        match self.vad.classify(&frame) {
            VadEvent::SilenceContinue => {
                if self.vad.state() == VadState::Silence
                    && let Some(id) = self.utterance.take()
                {
                    debug!(session = %self.id, "utterance {id} too short, dropped");
                    self.send_asr(AsrCommand::Abort)?;
                }
            }
            VadEvent::SpeechStart { frames } => {
                self.next_utterance_id += 1;
                let utterance_id = self.next_utterance_id;
                self.utterance = Some(utterance_id);
                self.emit(RuntimeEvent::SpeechStarted { utterance_id });

                let (action, transition) = self.turn.on_speech_start();
                self.emit_turn(transition);
                if action == SpeechStartAction::BargeIn {
                    self.barge_in().await?;
                }

                self.send_asr(AsrCommand::Begin { utterance_id })?;
                self.send_asr(AsrCommand::Frames(frames))?;
            }
            VadEvent::SpeechContinue => {
                if self.utterance.is_some() {
                    self.send_asr(AsrCommand::Frames(vec![frame]))?;
                }
            }
            VadEvent::SpeechEnd {
                utterance,
                voiced_ms,
            } => {
                if let Some(utterance_id) = self.utterance.take() {
                    self.summary.utterances += 1;
                    self.send_asr(AsrCommand::Frames(vec![frame]))?;
                    self.send_asr(AsrCommand::Finalize {
                        utterance_id,
                        started_at: utterance.started_at,
                    })?;
                    self.emit(RuntimeEvent::SpeechEnded {
                        utterance_id,
                        voiced_ms: voiced_ms.round() as u64,
                    });
                }
            }
        }
        Ok(())
    }

    async fn on_control(&mut self, event: ControlEvent) -> Result<()> {
        match event {
            ControlEvent::Transcript(transcription) => self.on_transcript(transcription).await?,
            ControlEvent::PartialTranscript { utterance_id, text } => {
                // The ASR stage reports partials for an utterance before its final result.
                if !text.trim().is_empty() {
                    self.emit(RuntimeEvent::PartialTranscript {
                        utterance_id,
                        text: text.trim().to_owned(),
                    });
                }
            }
            ControlEvent::AsrFailed {
                utterance_id,
                error,
            } => {
                warn!(session = %self.id, "utterance {utterance_id} not transcribed: {error}");
                self.emit(RuntimeEvent::Error {
                    stage: "asr".to_owned(),
                    message: error.to_string(),
                });
            }
            ControlEvent::PlaybackStarted { sequence_id } => {
                if self.is_live(sequence_id) {
                    let transition = self.turn.on_playback_started();
                    self.emit_turn(transition);
                }
            }
            ControlEvent::ChunkPlayed {
                sequence_id,
                index,
                text,
                skipped,
            } => {
                let Some(live) = self.live.as_mut().filter(|l| l.sequence_id == sequence_id)
                else {
                    return Ok(());
                };
                match skipped {
                    Some(reason) => self.emit(RuntimeEvent::ChunkSkipped {
                        sequence_id,
                        index,
                        reason,
                    }),
                    None => {
                        live.spoken.push(text.clone());
                        self.emit(RuntimeEvent::AssistantChunk {
                            sequence_id,
                            index,
                            text,
                        });
                    }
                }
            }
            ControlEvent::PlaybackFinished { sequence_id } => {
                if let Some(live) = self.live.as_mut().filter(|l| l.sequence_id == sequence_id) {
                    live.playback_done = true;
                    self.try_complete_response();
                }
            }
            ControlEvent::GenerationFinished(generation) => {
                let sequence_id = generation.sequence_id;
                if let Some(live) = self.live.as_mut().filter(|l| l.sequence_id == sequence_id) {
                    live.generation = Some(generation);
                    self.try_complete_response();
                } else {
                    debug!(session = %self.id, "generation summary for retired sequence {sequence_id}");
                }
            }
        }
        Ok(())
    }

    async fn on_transcript(&mut self, transcription: Transcription) -> Result<()> {
        let text = transcription.text.trim();
        if text.is_empty() {
            debug!(
                session = %self.id,
                "empty transcript for utterance {}, ignored",
                transcription.utterance_id
            );
            return Ok(());
        }
        self.emit(RuntimeEvent::Transcript {
            utterance_id: transcription.utterance_id,
            text: text.to_owned(),
        });

        let Some(transition) = self.turn.on_final_transcript() else {
            info!(
                session = %self.id,
                "transcript \"{text}\" arrived while {}, not answered",
                self.turn.state()
            );
            return Ok(());
        };
        self.emit_turn(Some(transition));
        self.start_response(text).await
    }

    async fn start_response(&mut self, text: &str) -> Result<()> {
        if let Some(prev) = self.live.take() {
            warn!(session = %self.id, "sequence {} still live at new response", prev.sequence_id);
            self.cancel_sequence(&prev).await?;
        }

        self.next_sequence_id += 1;
        let sequence_id = self.next_sequence_id;
        let token = self.cancel.child_token();
        let prompt = Prompt::build(&self.config.llm, &self.history, text);
        self.history.push_user(text);

        self.send_playback(PlaybackInput::Begin {
            sequence_id,
            cancel: token.clone(),
        })
        .await?;

        let ResponseStream { chunks, handle } =
            self.generator.generate(prompt, sequence_id, token.clone());
        // The dispatcher ends on its own once the generator closes `chunks`.
        drop(
            self.pool
                .dispatch(sequence_id, chunks, self.playback_tx.clone(), token.clone()),
        );

        let control_tx = self.control_tx.clone();
        tokio::spawn(async move {
            let summary = match handle.await {
                Ok(summary) => summary,
                Err(e) => GenerationSummary {
                    sequence_id,
                    text: String::new(),
                    chunk_count: 0,
                    outcome: GenerationOutcome::Failed(VoiceError::Llm(format!(
                        "generator task failed: {e}"
                    ))),
                },
            };
            let _ = control_tx.send(ControlEvent::GenerationFinished(summary));
        });

        info!(session = %self.id, "sequence {sequence_id} started for \"{text}\"");
        self.live = Some(LiveResponse {
            sequence_id,
            token,
            spoken: Vec::new(),
            generation: None,
            playback_done: false,
        });
        Ok(())
    }

    /// Finish the live response once generation ended and playback drained.
    fn try_complete_response(&mut self) {
        let ready = self
            .live
            .as_ref()
            .is_some_and(|l| l.playback_done && l.generation.is_some());
        if !ready {
            return;
        }
        let Some(LiveResponse {
            sequence_id,
            spoken,
            generation: Some(generation),
            ..
        }) = self.live.take()
        else {
            return;
        };

        let (text, error) = match generation.outcome {
            GenerationOutcome::Completed => (generation.text, None),
            GenerationOutcome::Failed(e) => (spoken.join(" "), Some(e.to_string())),
            GenerationOutcome::Cancelled => (spoken.join(" "), None),
        };
        if !text.is_empty() {
            self.history.push_agent(&text);
        }
        self.summary.responses += 1;

        if let Some(message) = &error {
            self.emit(RuntimeEvent::Error {
                stage: "llm".to_owned(),
                message: message.clone(),
            });
        }
        self.emit(RuntimeEvent::ResponseFinished {
            sequence_id,
            text: text.clone(),
            error,
        });
        let transition = self.turn.on_response_complete();
        self.emit_turn(transition);

        if let Some(phrase) = closing_phrase(&text, &self.config.conversation.closing_phrases) {
            info!(session = %self.id, "closing phrase \"{phrase}\" spoken, conversation finished");
            self.summary.conversation_finished = true;
            self.finished = true;
            self.emit(RuntimeEvent::ConversationFinished { phrase });
        }
    }

    async fn barge_in(&mut self) -> Result<()> {
        let Some(live) = self.live.take() else {
            let transition = self.turn.on_interruption_handled();
            self.emit_turn(transition);
            return Ok(());
        };
        info!(
            session = %self.id,
            "barge-in: cancelling sequence {} after {} chunks",
            live.sequence_id,
            live.spoken.len()
        );
        self.cancel_sequence(&live).await?;
        self.history.push_agent_interrupted(&live.spoken.join(" "));
        self.summary.barge_ins += 1;
        self.emit(RuntimeEvent::BargeIn {
            sequence_id: live.sequence_id,
        });
        let transition = self.turn.on_interruption_handled();
        self.emit_turn(transition);
        Ok(())
    }

    async fn cancel_sequence(&mut self, live: &LiveResponse) -> Result<()> {
        live.token.cancel();
        self.send_playback(PlaybackInput::Cancel {
            sequence_id: live.sequence_id,
        })
        .await
    }

    /// Ask the model for the order placed in this conversation.
    async fn run_order_extraction(&mut self) {
        let conversation = &self.config.conversation;
        let timeout = Duration::from_millis(conversation.extraction_timeout_ms);
        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return,
            r = extract_order(
                self.llm.as_ref(),
                &self.config.llm,
                &self.history,
                &conversation.extraction_prompt,
                timeout,
            ) => r,
        };
        match result {
            Ok(order) => {
                self.emit(RuntimeEvent::OrderExtracted {
                    order: order.clone(),
                });
                self.summary.extracted_order = Some(order);
            }
            Err(e) => {
                warn!(session = %self.id, "order extraction failed: {e}");
                self.emit(RuntimeEvent::Error {
                    stage: "extraction".to_owned(),
                    message: e.to_string(),
                });
            }
        }
    }

    fn close(&mut self) {
        if let Some(live) = self.live.take() {
            live.token.cancel();
        }
        let transition = self.turn.terminate();
        self.emit_turn(transition);
    }

    fn into_summary(self) -> SessionSummary {
        SessionSummary {
            history: self.history.entries().to_vec(),
            vad: self.vad.stats().clone(),
            ..self.summary
        }
    }

    fn is_live(&self, sequence_id: SequenceId) -> bool {
        self.live.as_ref().is_some_and(|l| l.sequence_id == sequence_id)
    }

    fn send_asr(&self, cmd: AsrCommand) -> Result<()> {
        self.asr_tx
            .send(cmd)
            .map_err(|_| VoiceError::Session("ASR stage stopped".to_owned()))
    }

    async fn send_playback(&self, input: PlaybackInput) -> Result<()> {
        self.playback_tx
            .send(input)
            .await
            .map_err(|_| VoiceError::Session("playback stage stopped".to_owned()))
    }

    fn emit(&self, event: RuntimeEvent) {
        if let Some(tx) = &self.runtime_tx {
            let _ = tx.send(event);
        }
    }

    fn emit_turn(&self, transition: Option<TurnTransition>) {
        if let Some(TurnTransition { from, to }) = transition {
            info!(session = %self.id, "turn {from} -> {to}");
            self.emit(RuntimeEvent::Turn { from, to });
        }
    }
}

/// First configured closing phrase contained in `text`, case-insensitively.
fn closing_phrase(text: &str, phrases: &[String]) -> Option<String> {
    let lower = text.to_lowercase();
    phrases
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .find(|p| lower.contains(&p.to_lowercase()))
        .map(str::to_owned)
}
