//! User speech over the agent.

use crate::helpers::*;
use parley::RuntimeEvent;
use parley::llm::Role;
use parley::pipeline::TurnState;
use parley::pipeline::messages::OutboundAudio;
use std::sync::Arc;

/// Two seconds of audio per chunk keeps the agent speaking while the test talks.
const LONG_CHUNK: usize = 2 * TTS_RATE as usize;

#[tokio::test]
async fn speech_during_playback_cancels_response() {
    let llm = Arc::new(ScriptedLlm::new(vec![Reply::hanging(&[
        "Sure thing. ",
        "Let me check",
    ])]));
    let mut h = Harness::start(
        test_config(),
        services(ScriptedAsr::new(&["is it open"]), llm, FakeTts::new(LONG_CHUNK)),
    );
    h.say().await;
    h.wait_for(|e| matches!(e, RuntimeEvent::Turn { to: TurnState::Speaking, .. }))
        .await;

    let frames = h.source.speech(5);
    h.send(frames).await;
    let (_, seen) = h
        .wait_for(|e| matches!(e, RuntimeEvent::BargeIn { sequence_id: 1 }))
        .await;
    assert!(seen.contains(&RuntimeEvent::Turn {
        from: TurnState::Speaking,
        to: TurnState::Interrupted,
    }));
    h.wait_for(|e| {
        matches!(
            e,
            RuntimeEvent::Turn {
                from: TurnState::Interrupted,
                to: TurnState::Listening
            }
        )
    })
    .await;

    let done = h.finish().await;
    assert_eq!(done.summary.barge_ins, 1);
    assert_eq!(done.summary.responses, 0);
    assert!(!done
        .events
        .iter()
        .any(|e| matches!(e, RuntimeEvent::ResponseFinished { .. })));

    let last = done.summary.history.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert!(last.interrupted);
    assert_eq!(last.text, "Sure thing.");

    // Only the first chunk was written, then the transport was told to drop it.
    let truncate_at = done
        .outbound
        .iter()
        .position(|o| matches!(o, OutboundAudio::Truncate { sequence_id: 1 }))
        .unwrap();
    assert_eq!(chunk_indices(&done.outbound[..truncate_at]), vec![0]);
    assert!(chunk_indices(&done.outbound[truncate_at..]).is_empty());
}

#[tokio::test]
async fn speech_while_thinking_does_not_interrupt() {
    let llm = Arc::new(ScriptedLlm::new(vec![Reply::hanging(&[])]));
    let mut h = Harness::start(
        test_config(),
        services(ScriptedAsr::new(&["hello"]), llm, FakeTts::new(240)),
    );
    h.say().await;
    h.wait_for(|e| matches!(e, RuntimeEvent::Turn { to: TurnState::Thinking, .. }))
        .await;

    let frames = h.source.speech(5);
    h.send(frames).await;
    h.wait_for(|e| matches!(e, RuntimeEvent::SpeechStarted { utterance_id: 2 }))
        .await;

    let done = h.finish().await;
    assert_eq!(done.summary.barge_ins, 0);
    assert!(!done
        .events
        .iter()
        .any(|e| matches!(e, RuntimeEvent::BargeIn { .. })));
    assert!(done.outbound.is_empty());
}

#[tokio::test]
async fn barge_in_disabled_lets_agent_finish() {
    let llm = Arc::new(ScriptedLlm::new(vec![Reply::tokens(&["One moment please."])]));
    let mut config = test_config();
    config.conversation.barge_in = false;
    let mut h = Harness::start(
        config,
        services(ScriptedAsr::new(&["hello"]), llm, FakeTts::new(4_800)),
    );
    h.say().await;
    h.wait_for(|e| matches!(e, RuntimeEvent::Turn { to: TurnState::Speaking, .. }))
        .await;

    let frames = h.source.speech(5);
    h.send(frames).await;
    let (_, seen) = h
        .wait_for(|e| matches!(e, RuntimeEvent::ResponseFinished { .. }))
        .await;
    assert!(!seen.iter().any(|e| matches!(e, RuntimeEvent::BargeIn { .. })));

    let done = h.finish().await;
    assert_eq!(done.summary.responses, 1);
    assert!(
        !done
            .outbound
            .iter()
            .any(|o| matches!(o, OutboundAudio::Truncate { .. }))
    );
}

#[tokio::test]
async fn new_utterance_after_barge_in_is_answered() {
    let llm = Arc::new(ScriptedLlm::new(vec![
        Reply::hanging(&["Sure thing. ", "Let me check"]),
        Reply::tokens(&["Okay."]),
    ]));
    let mut h = Harness::start(
        test_config(),
        services(
            ScriptedAsr::new(&["is it open", "never mind"]),
            llm.clone(),
            FakeTts::new(LONG_CHUNK),
        ),
    );
    h.say().await;
    h.wait_for(|e| matches!(e, RuntimeEvent::Turn { to: TurnState::Speaking, .. }))
        .await;

    h.say().await;
    let (_, seen) = h
        .wait_for(|e| matches!(e, RuntimeEvent::ResponseFinished { sequence_id: 2, .. }))
        .await;
    assert!(seen.contains(&RuntimeEvent::BargeIn { sequence_id: 1 }));
    assert!(!seen
        .iter()
        .any(|e| matches!(e, RuntimeEvent::ResponseFinished { sequence_id: 1, .. })));

    let done = h.finish().await;
    assert_eq!(done.summary.barge_ins, 1);
    assert_eq!(done.summary.responses, 1);

    let truncate_at = done
        .outbound
        .iter()
        .position(|o| matches!(o, OutboundAudio::Truncate { sequence_id: 1 }))
        .unwrap();
    let sequences = |items: &[OutboundAudio]| -> Vec<(u64, u64)> {
        items
            .iter()
            .filter_map(|o| match o {
                OutboundAudio::Chunk(c) => Some((c.sequence_id, c.index)),
                OutboundAudio::Truncate { .. } => None,
            })
            .collect()
    };
    assert_eq!(sequences(&done.outbound[..truncate_at]), vec![(1, 0)]);
    assert_eq!(sequences(&done.outbound[truncate_at..]), vec![(2, 0)]);

    let history: Vec<(Role, &str, bool)> = done
        .summary
        .history
        .iter()
        .map(|e| (e.role, e.text.as_str(), e.interrupted))
        .collect();
    assert_eq!(
        history,
        vec![
            (Role::User, "is it open", false),
            (Role::Assistant, "Sure thing.", true),
            (Role::User, "never mind", false),
            (Role::Assistant, "Okay.", false),
        ]
    );

    let prompts = llm.prompts.lock().unwrap();
    let second: Vec<&str> = prompts[1]
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(second, vec!["is it open", "Sure thing. [interrupted]", "never mind"]);
}
