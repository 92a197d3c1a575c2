//! WebSocket bridge end to end.

use crate::helpers::*;
use futures_util::{SinkExt, StreamExt};
use parley::audio::f32_to_pcm16;
use parley::server::{AppState, serve};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

async fn start_server(
    factory: FakeFactory,
) -> (
    std::net::SocketAddr,
    Arc<AppState>,
    CancellationToken,
    tokio::task::JoinHandle<parley::Result<()>>,
) {
    let state = Arc::new(AppState::new(test_config(), Arc::new(factory)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve(listener, state.clone(), shutdown.clone()));
    (addr, state, shutdown, server)
}

#[tokio::test]
async fn pcm_in_speech_and_events_out() {
    let (addr, state, shutdown, server) = start_server(FakeFactory {
        transcripts: vec!["hello".to_owned()],
        replies: vec![Reply::tokens(&["Hi there. ", "How can I help?"])],
        tts_samples: 480,
    })
    .await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/agents/default/ws"))
        .await
        .unwrap();

    let mut pcm = Vec::new();
    for frame in FrameSource::default().utterance() {
        pcm.extend(f32_to_pcm16(&frame.samples));
    }
    ws.send(Message::Binary(pcm)).await.unwrap();

    let expected_audio = 2 * 480 * 2;
    let mut audio_bytes = 0;
    let mut types = Vec::new();
    let read = async {
        while let Some(msg) = ws.next().await {
            match msg.unwrap() {
                Message::Binary(bytes) => audio_bytes += bytes.len(),
                Message::Text(text) => {
                    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
                    types.push(json["type"].as_str().unwrap_or_default().to_owned());
                }
                _ => {}
            }
            if audio_bytes >= expected_audio && types.iter().any(|t| t == "response_finished") {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .expect("no response over the socket");

    assert_eq!(audio_bytes, expected_audio);
    assert!(types.iter().any(|t| t == "transcript"));
    assert!(types.iter().any(|t| t == "turn"));
    assert_eq!(state.registry().len().await, 1);

    ws.close(None).await.unwrap();
    let drained = async {
        while !state.registry().is_empty().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), drained)
        .await
        .expect("session not removed after disconnect");

    shutdown.cancel();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_agent_is_rejected() {
    let (addr, _state, shutdown, server) = start_server(FakeFactory {
        transcripts: Vec::new(),
        replies: Vec::new(),
        tts_samples: 0,
    })
    .await;

    let result =
        tokio_tungstenite::connect_async(format!("ws://{addr}/agents/nobody/ws")).await;
    assert!(result.is_err());

    shutdown.cancel();
    server.await.unwrap().unwrap();
}
