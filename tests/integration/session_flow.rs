//! End-to-end turns through a session with scripted services.

use crate::helpers::*;
use parley::RuntimeEvent;
use parley::llm::Role;
use parley::pipeline::TurnState;
use parley::pipeline::messages::{ChunkPayload, OutboundAudio};
use parley::llm::extract::DEFAULT_EXTRACTION_PROMPT;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn is_turn_to(to: TurnState) -> impl Fn(&RuntimeEvent) -> bool {
    move |e| matches!(e, RuntimeEvent::Turn { to: t, .. } if *t == to)
}

#[tokio::test]
async fn full_turn_plays_chunks_in_order() {
    let llm = Arc::new(ScriptedLlm::new(vec![Reply::tokens(&[
        "Sure",
        ", one pizza. ",
        "Anything ",
        "else? ",
        "Thanks!",
    ])]));
    let mut h = Harness::start(
        test_config(),
        services(ScriptedAsr::new(&["one pizza please"]), llm.clone(), FakeTts::new(240)),
    );
    h.say().await;

    let (finished, seen) = h
        .wait_for(|e| matches!(e, RuntimeEvent::ResponseFinished { .. }))
        .await;
    let RuntimeEvent::ResponseFinished {
        sequence_id,
        text,
        error,
    } = finished
    else {
        unreachable!()
    };
    assert_eq!(sequence_id, 1);
    assert_eq!(text, "Sure, one pizza. Anything else? Thanks!");
    assert!(error.is_none());

    assert!(seen.contains(&RuntimeEvent::Transcript {
        utterance_id: 1,
        text: "one pizza please".to_owned(),
    }));
    let chunks: Vec<(u64, &str)> = seen
        .iter()
        .filter_map(|e| match e {
            RuntimeEvent::AssistantChunk { index, text, .. } => Some((*index, text.as_str())),
            _ => None,
        })
        .collect();
    assert_eq!(
        chunks,
        vec![(0, "Sure, one pizza."), (1, "Anything else?"), (2, "Thanks!")]
    );
    let turns: Vec<TurnState> = seen
        .iter()
        .filter_map(|e| match e {
            RuntimeEvent::Turn { to, .. } => Some(*to),
            _ => None,
        })
        .collect();
    assert_eq!(turns, vec![TurnState::Thinking, TurnState::Speaking]);

    h.wait_for(is_turn_to(TurnState::Listening)).await;
    let done = h.finish().await;

    assert_eq!(chunk_indices(&done.outbound), vec![0, 1, 2]);
    assert_eq!(done.summary.utterances, 1);
    assert_eq!(done.summary.responses, 1);
    let history = &done.summary.history;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].text, "one pizza please");
    assert_eq!(history[1].role, Role::Assistant);
    assert!(!history[1].interrupted);

    let prompts = llm.prompts.lock().unwrap();
    let last = prompts[0].messages.last().unwrap();
    assert_eq!(last.role, Role::User);
    assert_eq!(last.content, "one pizza please");
}

#[tokio::test]
async fn second_turn_sees_first_exchange() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        Reply::tokens(&["What size? "]),
        Reply::tokens(&["Large it is."]),
    ]));
    let mut h = Harness::start(
        test_config(),
        services(
            ScriptedAsr::new(&["a pizza", "large"]),
            llm.clone(),
            FakeTts::new(240),
        ),
    );
    h.say().await;
    h.wait_for(is_turn_to(TurnState::Listening)).await;
    h.say().await;
    h.wait_for(|e| matches!(e, RuntimeEvent::ResponseFinished { sequence_id: 2, .. }))
        .await;
    h.finish().await;

    let prompts = llm.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 2);
    let contents: Vec<(Role, &str)> = prompts[1]
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| (m.role, m.content.as_str()))
        .collect();
    assert_eq!(
        contents,
        vec![
            (Role::User, "a pizza"),
            (Role::Assistant, "What size?"),
            (Role::User, "large"),
        ]
    );
}

#[tokio::test]
async fn slow_first_chunk_still_plays_first() {
    let llm = Arc::new(ScriptedLlm::new(vec![Reply::tokens(&[
        "First part. ",
        "Second part. ",
        "Third part.",
    ])]));
    let tts = FakeTts::new(240).delay("First", 200).delay("Second", 60);
    let mut h = Harness::start(
        test_config(),
        services(ScriptedAsr::new(&["go"]), llm, tts),
    );
    h.say().await;
    h.wait_for(|e| matches!(e, RuntimeEvent::ResponseFinished { .. }))
        .await;
    let done = h.finish().await;

    assert_eq!(chunk_indices(&done.outbound), vec![0, 1, 2]);
    let texts: Vec<&str> = done
        .outbound
        .iter()
        .filter_map(|o| match o {
            OutboundAudio::Chunk(c) => Some(c.text.as_str()),
            OutboundAudio::Truncate { .. } => None,
        })
        .collect();
    assert_eq!(texts, vec!["First part.", "Second part.", "Third part."]);
}

#[tokio::test]
async fn failed_synthesis_becomes_a_gap() {
    let llm = Arc::new(ScriptedLlm::new(vec![Reply::tokens(&[
        "Good. ",
        "This is broken. ",
        "Done.",
    ])]));
    let mut h = Harness::start(
        test_config(),
        services(
            ScriptedAsr::new(&["hi"]),
            llm,
            FakeTts::new(240).fail_on("broken"),
        ),
    );
    h.say().await;
    let (_, seen) = h
        .wait_for(|e| matches!(e, RuntimeEvent::ResponseFinished { .. }))
        .await;

    assert!(seen.iter().any(|e| matches!(
        e,
        RuntimeEvent::ChunkSkipped { index: 1, .. }
    )));
    let spoken: Vec<u64> = seen
        .iter()
        .filter_map(|e| match e {
            RuntimeEvent::AssistantChunk { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(spoken, vec![0, 2]);

    let done = h.finish().await;
    assert_eq!(chunk_indices(&done.outbound), vec![0, 1, 2]);
    let gap = done
        .outbound
        .iter()
        .find_map(|o| match o {
            OutboundAudio::Chunk(c) if c.index == 1 => Some(&c.payload),
            _ => None,
        })
        .unwrap();
    assert!(matches!(gap, ChunkPayload::Skipped { gap_ms: 40, .. }));
}

#[tokio::test]
async fn closing_phrase_ends_the_session() {
    let llm = Arc::new(ScriptedLlm::new(vec![Reply::tokens(&[
        "Great, your order is confirmed. ",
        "See you soon!",
    ])]));
    let mut h = Harness::start(
        test_config(),
        services(ScriptedAsr::new(&["that's all"]), llm, FakeTts::new(240)),
    );
    h.say().await;
    let (event, _) = h
        .wait_for(|e| matches!(e, RuntimeEvent::ConversationFinished { .. }))
        .await;
    assert_eq!(
        event,
        RuntimeEvent::ConversationFinished {
            phrase: "your order is confirmed".to_owned()
        }
    );

    // The session stops without the audio input closing.
    let done = h.join().await;
    assert!(done.summary.conversation_finished);
    assert!(done.events.contains(&RuntimeEvent::Turn {
        from: TurnState::Listening,
        to: TurnState::Terminated,
    }));
}

#[tokio::test]
async fn short_noise_is_never_transcribed() {
    let asr = ScriptedAsr::new(&["should not appear"]);
    let finalized = asr.finalized.clone();
    let llm = Arc::new(ScriptedLlm::new(Vec::new()));
    let mut h = Harness::start(test_config(), services(asr, llm, FakeTts::new(240)));

    let mut frames = h.source.speech(5);
    frames.extend(h.source.silence(30));
    h.send(frames).await;
    let done = h.finish().await;

    assert_eq!(finalized.load(Ordering::SeqCst), 0);
    assert_eq!(done.summary.utterances, 0);
    assert_eq!(done.summary.vad.discarded, 1);
    assert!(done.summary.history.is_empty());
    assert!(done
        .events
        .iter()
        .any(|e| matches!(e, RuntimeEvent::SpeechStarted { utterance_id: 1 })));
    assert!(!done
        .events
        .iter()
        .any(|e| matches!(e, RuntimeEvent::SpeechEnded { .. } | RuntimeEvent::Transcript { .. })));
}

#[tokio::test]
async fn empty_transcript_keeps_listening() {
    let llm = Arc::new(ScriptedLlm::new(Vec::new()));
    let mut h = Harness::start(
        test_config(),
        services(ScriptedAsr::new(&["   "]), llm.clone(), FakeTts::new(240)),
    );
    h.say().await;
    h.wait_for(|e| matches!(e, RuntimeEvent::SpeechEnded { .. }))
        .await;
    let done = h.finish().await;

    assert!(llm.prompts.lock().unwrap().is_empty());
    assert_eq!(done.summary.responses, 0);
    assert!(!done
        .events
        .iter()
        .any(|e| matches!(e, RuntimeEvent::Turn { to: TurnState::Thinking, .. })));
}

#[tokio::test]
async fn sentences_play_in_order_when_synthesis_finishes_backwards() {
    let llm = Arc::new(ScriptedLlm::new(vec![Reply::tokens(&[
        "Hello ",
        "there. How can ",
        "I help you today? ",
        "Sure thing!",
    ])]));
    let tts = FakeTts::new(240).delay("Hello", 300).delay("help", 150);
    let mut h = Harness::start(
        test_config(),
        services(ScriptedAsr::new(&["hi"]), llm, tts),
    );
    h.say().await;
    let (finished, seen) = h
        .wait_for(|e| matches!(e, RuntimeEvent::ResponseFinished { .. }))
        .await;
    assert!(matches!(
        finished,
        RuntimeEvent::ResponseFinished { ref text, error: None, .. }
            if text == "Hello there. How can I help you today? Sure thing!"
    ));
    let played: Vec<u64> = seen
        .iter()
        .filter_map(|e| match e {
            RuntimeEvent::AssistantChunk { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(played, vec![0, 1, 2]);

    let done = h.finish().await;
    assert_eq!(chunk_indices(&done.outbound), vec![0, 1, 2]);
    let texts: Vec<&str> = done
        .outbound
        .iter()
        .filter_map(|o| match o {
            OutboundAudio::Chunk(c) => Some(c.text.as_str()),
            OutboundAudio::Truncate { .. } => None,
        })
        .collect();
    assert_eq!(
        texts,
        vec!["Hello there.", "How can I help you today?", "Sure thing!"]
    );
}

#[tokio::test]
async fn model_failure_after_first_chunk_keeps_spoken_text() {
    let llm = Arc::new(ScriptedLlm::new(vec![Reply::failing(&[
        "Hello there. ",
        "How can",
    ])]));
    let mut h = Harness::start(
        test_config(),
        services(ScriptedAsr::new(&["hi"]), llm, FakeTts::new(240)),
    );
    h.say().await;
    let (finished, seen) = h
        .wait_for(|e| matches!(e, RuntimeEvent::ResponseFinished { .. }))
        .await;
    let RuntimeEvent::ResponseFinished {
        sequence_id,
        text,
        error,
    } = finished
    else {
        unreachable!()
    };
    assert_eq!(sequence_id, 1);
    assert_eq!(text, "Hello there.");
    assert!(error.unwrap().contains("upstream reset"));
    assert!(seen
        .iter()
        .any(|e| matches!(e, RuntimeEvent::Error { stage, .. } if stage == "llm")));

    h.wait_for(is_turn_to(TurnState::Listening)).await;
    let done = h.finish().await;
    assert_eq!(chunk_indices(&done.outbound), vec![0]);
    assert_eq!(done.summary.responses, 1);
    let last = done.summary.history.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.text, "Hello there.");
    assert!(!last.interrupted);
}

#[tokio::test]
async fn stalled_model_times_out_after_first_chunk() {
    let llm = Arc::new(ScriptedLlm::new(vec![Reply::hanging(&["One second. ", "Let"])]));
    let mut config = test_config();
    config.llm.stall_timeout_ms = 200;
    let mut h = Harness::start(
        config,
        services(ScriptedAsr::new(&["hi"]), llm, FakeTts::new(240)),
    );
    h.say().await;
    let (error, _) = h
        .wait_for(|e| matches!(e, RuntimeEvent::Error { .. }))
        .await;
    assert_eq!(
        error,
        RuntimeEvent::Error {
            stage: "llm".to_owned(),
            message: "llm timed out after 200ms".to_owned(),
        }
    );
    h.wait_for(is_turn_to(TurnState::Listening)).await;

    let done = h.finish().await;
    assert_eq!(chunk_indices(&done.outbound), vec![0]);
    assert_eq!(done.summary.history.last().unwrap().text, "One second.");
}

#[tokio::test]
async fn failed_transcription_keeps_listening() {
    let llm = Arc::new(ScriptedLlm::new(vec![Reply::tokens(&["Hi again."])]));
    let mut h = Harness::start(
        test_config(),
        services(
            ScriptedAsr::new(&["hello again"]).fail_first(),
            llm.clone(),
            FakeTts::new(240),
        ),
    );
    h.say().await;
    let (error, seen) = h
        .wait_for(|e| matches!(e, RuntimeEvent::Error { .. }))
        .await;
    assert!(matches!(error, RuntimeEvent::Error { ref stage, .. } if stage == "asr"));
    assert!(!seen.iter().any(|e| matches!(e, RuntimeEvent::Turn { .. })));
    assert!(llm.prompts.lock().unwrap().is_empty());

    // The next utterance is answered as the first response.
    h.say().await;
    h.wait_for(|e| matches!(e, RuntimeEvent::ResponseFinished { sequence_id: 1, .. }))
        .await;
    let done = h.finish().await;
    assert_eq!(done.summary.utterances, 2);
    assert_eq!(done.summary.responses, 1);
    assert_eq!(done.summary.history[0].text, "hello again");
    assert_eq!(llm.prompts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn transcription_timeout_is_reported() {
    let llm = Arc::new(ScriptedLlm::new(Vec::new()));
    let mut config = test_config();
    config.asr.finalize_timeout_ms = 100;
    let mut h = Harness::start(
        config,
        services(
            ScriptedAsr::new(&["too late"]).with_delay(Duration::from_secs(1)),
            llm.clone(),
            FakeTts::new(240),
        ),
    );
    h.say().await;
    let (error, seen) = h
        .wait_for(|e| matches!(e, RuntimeEvent::Error { .. }))
        .await;
    assert_eq!(
        error,
        RuntimeEvent::Error {
            stage: "asr".to_owned(),
            message: "asr timed out after 100ms".to_owned(),
        }
    );
    assert!(!seen.iter().any(|e| matches!(e, RuntimeEvent::Transcript { .. })));

    let done = h.finish().await;
    assert_eq!(done.summary.responses, 0);
    assert!(done.summary.history.is_empty());
    assert!(llm.prompts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn slow_transcription_does_not_stall_session() {
    let asr = ScriptedAsr::new(&["first", "second"]).with_delay(Duration::from_secs(3));
    let llm = Arc::new(ScriptedLlm::new(Vec::new()));
    let mut h = Harness::start(test_config(), services(asr, llm, FakeTts::new(240)));
    h.say().await;
    h.wait_for(|e| matches!(e, RuntimeEvent::SpeechEnded { utterance_id: 1, .. }))
        .await;

    // Far more frames than fit in any stage buffer while the first finalize runs.
    let mut frames = h.source.speech(300);
    frames.extend(h.source.silence(30));
    let (_, seen) = tokio::time::timeout(Duration::from_secs(1), async {
        h.send(frames).await;
        h.wait_for(|e| matches!(e, RuntimeEvent::SpeechEnded { utterance_id: 2, .. }))
            .await
    })
    .await
    .expect("session loop waited on transcription");
    assert!(!seen.iter().any(|e| matches!(e, RuntimeEvent::Transcript { .. })));

    let done = tokio::time::timeout(Duration::from_secs(1), h.finish())
        .await
        .expect("shutdown waited on transcription");
    assert_eq!(done.summary.utterances, 2);
}

#[tokio::test]
async fn partial_transcript_precedes_final() {
    let llm = Arc::new(ScriptedLlm::new(vec![Reply::tokens(&["Sure."])]));
    let mut h = Harness::start(
        test_config(),
        services(
            ScriptedAsr::new(&["one pizza"]).with_partial("one pi"),
            llm,
            FakeTts::new(240),
        ),
    );
    h.say().await;
    let (_, seen) = h
        .wait_for(|e| matches!(e, RuntimeEvent::Transcript { .. }))
        .await;
    let partials: Vec<&RuntimeEvent> = seen
        .iter()
        .filter(|e| matches!(e, RuntimeEvent::PartialTranscript { .. }))
        .collect();
    assert_eq!(
        partials,
        vec![&RuntimeEvent::PartialTranscript {
            utterance_id: 1,
            text: "one pi".to_owned(),
        }]
    );
    h.finish().await;
}

#[tokio::test]
async fn finished_conversation_extracts_order() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        Reply::tokens(&["Two margheritas, your order is confirmed."]),
        Reply::tokens(&[
            "```json\n{\"items\": [",
            "{\"product_name\": \"Margherita\", \"quantity\": 2}]}\n```",
        ]),
    ]));
    let mut config = test_config();
    config.conversation.extract_order = true;
    let mut h = Harness::start(
        config,
        services(ScriptedAsr::new(&["two margheritas"]), llm.clone(), FakeTts::new(240)),
    );
    h.say().await;
    let (event, seen) = h
        .wait_for(|e| matches!(e, RuntimeEvent::OrderExtracted { .. }))
        .await;
    assert!(seen
        .iter()
        .any(|e| matches!(e, RuntimeEvent::ConversationFinished { .. })));
    let RuntimeEvent::OrderExtracted { order } = event else {
        unreachable!()
    };
    assert_eq!(order["items"][0]["quantity"], 2);

    let done = h.join().await;
    assert_eq!(done.summary.extracted_order, Some(order));
    let prompts = llm.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 2);
    let contents: Vec<(Role, &str)> = prompts[1]
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| (m.role, m.content.as_str()))
        .collect();
    assert_eq!(
        contents,
        vec![
            (Role::User, "two margheritas"),
            (Role::Assistant, "Two margheritas, your order is confirmed."),
            (Role::User, DEFAULT_EXTRACTION_PROMPT),
        ]
    );
}

#[tokio::test]
async fn failed_extraction_still_ends_the_session() {
    let llm = Arc::new(ScriptedLlm::new(vec![Reply::tokens(&["Goodbye!"])]));
    let mut config = test_config();
    config.conversation.extract_order = true;
    let mut h = Harness::start(
        config,
        services(ScriptedAsr::new(&["bye"]), llm, FakeTts::new(240)),
    );
    h.say().await;
    let (error, _) = h
        .wait_for(|e| matches!(e, RuntimeEvent::Error { .. }))
        .await;
    assert!(matches!(error, RuntimeEvent::Error { ref stage, .. } if stage == "extraction"));

    let done = h.join().await;
    assert!(done.summary.conversation_finished);
    assert!(done.summary.extracted_order.is_none());
}
