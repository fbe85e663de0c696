//! End-to-end session tests against an in-process commentary service

use axum::{
    extract::{
        ws::{Message, WebSocket},
        WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use screen_commentary::{
    audio::{playback_channel, AudioClock, AudioFragment, AudioSink, ManualClock, PlaybackEvent, PlaybackNotifier},
    capture::{ScreenProvider, ScreenSource},
    codec::{DecodedAudio, FragmentDecoder},
    config::AppConfig,
    error::{AudioError, CaptureError, DecodeError, SessionError},
    network::TransportState,
    session::{CaptureSession, EndReason, PipelineParts, SessionSlot},
    Error,
};

/// Screen that renders until `ended` is set
struct TestScreen {
    ended: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

struct TestSource {
    ended: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl ScreenProvider for TestScreen {
    fn acquire(&self) -> Result<Box<dyn ScreenSource>, CaptureError> {
        Ok(Box::new(TestSource {
            ended: self.ended.clone(),
            stopped: self.stopped.clone(),
        }))
    }
}

impl ScreenSource for TestSource {
    fn grab(&mut self) -> Result<RgbaImage, CaptureError> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(CaptureError::SourceEnded);
        }
        Ok(RgbaImage::from_pixel(32, 18, Rgba([10, 200, 30, 255])))
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        "test screen".to_string()
    }
}

/// 10 ms of mono audio per input byte; a leading 0xFF is undecodable and
/// a leading 0xEE takes 300 ms to decode
struct TestDecoder;

impl FragmentDecoder for TestDecoder {
    fn decode(&self, data: &[u8]) -> Result<DecodedAudio, DecodeError> {
        match data.first() {
            Some(&0xFF) => return Err(DecodeError::DecodingFailed("corrupt fragment".into())),
            Some(&0xEE) => std::thread::sleep(Duration::from_millis(300)),
            _ => {}
        }
        Ok(DecodedAudio::new(vec![0.0; data.len() * 10], 1_000, 1))
    }
}

/// Records schedules and reports each fragment finished straight away
struct InstantSink {
    clock: ManualClock,
    played: Arc<Mutex<Vec<(u64, Duration, Duration)>>>,
    notifier: PlaybackNotifier,
}

impl AudioSink for InstantSink {
    fn clock(&self) -> Arc<dyn AudioClock> {
        Arc::new(self.clock.clone())
    }

    fn schedule(&mut self, fragment: AudioFragment, start_at: Duration) -> Result<(), AudioError> {
        self.played
            .lock()
            .push((fragment.sequence, start_at, fragment.duration()));
        let _ = self.notifier.send(PlaybackEvent::Finished {
            sequence: fragment.sequence,
        });
        Ok(())
    }

    fn cancel_all(&mut self) {}
}

struct Harness {
    parts: PipelineParts,
    played: Arc<Mutex<Vec<(u64, Duration, Duration)>>>,
    ended: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

fn harness() -> Harness {
    let (notifier, playback_events) = playback_channel();
    let played = Arc::new(Mutex::new(Vec::new()));
    let ended = Arc::new(AtomicBool::new(false));
    let stopped = Arc::new(AtomicBool::new(false));

    Harness {
        parts: PipelineParts {
            screen: Arc::new(TestScreen {
                ended: ended.clone(),
                stopped: stopped.clone(),
            }),
            decoder: Arc::new(TestDecoder),
            sink: Box::new(InstantSink {
                clock: ManualClock::new(),
                played: played.clone(),
                notifier,
            }),
            playback_events,
        },
        played,
        ended,
        stopped,
    }
}

fn audio_message(bytes: &[u8]) -> String {
    serde_json::json!({"type": "audio", "audio": STANDARD.encode(bytes)}).to_string()
}

/// Commentary service stand-in: acknowledges the handshake, sends
/// `script`, closes if asked, and forwards everything it receives
async fn mock_service(script: Vec<String>, close: bool) -> (String, mpsc::UnboundedReceiver<String>) {
    let (received_tx, received_rx) = mpsc::unbounded_channel();

    let app = Router::new().route(
        "/ws/:session_id",
        get(move |ws: WebSocketUpgrade| {
            let script = script.clone();
            let received_tx = received_tx.clone();
            async move {
                let response: Response =
                    ws.on_upgrade(move |socket| serve_session(socket, script, close, received_tx));
                response
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("ws://{}", addr), received_rx)
}

async fn serve_session(
    mut socket: WebSocket,
    script: Vec<String>,
    close: bool,
    received: mpsc::UnboundedSender<String>,
) {
    let Some(Ok(Message::Text(init))) = socket.recv().await else {
        return;
    };
    let _ = received.send(init);

    let _ = socket
        .send(Message::Text(r#"{"type":"ready"}"#.to_string()))
        .await;
    for message in script {
        let _ = socket.send(Message::Text(message)).await;
    }
    if close {
        let _ = socket.close().await;
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(text) => {
                let _ = received.send(text);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

fn config_for(endpoint: String, interval_ms: u64) -> AppConfig {
    let mut config = AppConfig::default();
    config.network.endpoint = endpoint;
    config.session.capture_interval = interval_ms;
    config.capture.render_fps = 60;
    config
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_commentary_plays_back_to_back_and_skips_bad_fragment() {
    let script = vec![
        "not json".to_string(),
        audio_message(&[0xFF, 0x00]),
        audio_message(&[1; 10]),
        audio_message(&[2; 20]),
    ];
    let (endpoint, mut received) = mock_service(script, false).await;
    let config = config_for(endpoint, 30_000);
    let first = harness();
    let played = first.played.clone();

    let slot = SessionSlot::new();
    let handle = slot
        .start(CaptureSession::new(21, config.session.clone()), &config, first.parts)
        .await
        .unwrap();

    let init: serde_json::Value = serde_json::from_str(&received.recv().await.unwrap()).unwrap();
    assert_eq!(init["type"], "init");
    assert_eq!(init["preferences"]["capture_interval"], 30_000);

    wait_until(|| played.lock().len() == 2).await;

    let log = played.lock().clone();
    assert_eq!(log[0].0, 1);
    assert_eq!(log[1].0, 2);
    // Second starts exactly where the first ends
    assert_eq!(log[1].1, log[0].1 + log[0].2);

    let status = handle.status().borrow().clone();
    assert_eq!(status.transport_state, TransportState::Ready);
    assert!(status.active);

    // Only one session at a time
    let err = slot
        .start(CaptureSession::new(22, config.session.clone()), &config, harness().parts)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::Session(SessionError::AlreadyActive)));

    let report = handle.shutdown().await.unwrap();
    assert_eq!(report.end_reason, EndReason::Stopped);
    assert_eq!(report.fragments_received, 3);
    assert_eq!(report.decode_failures, 1);
    assert_eq!(report.invalid_messages, 1);
    assert_eq!(report.fragments_played, 2);
    assert!(!slot.is_active());
    assert!(first.stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_slow_decode_still_plays_in_arrival_order() {
    let script = vec![audio_message(&[0xEE; 5]), audio_message(&[3; 5])];
    let (endpoint, _received) = mock_service(script, false).await;
    let config = config_for(endpoint, 30_000);
    let harness = harness();
    let played = harness.played.clone();

    let slot = SessionSlot::new();
    let handle = slot
        .start(CaptureSession::new(25, config.session.clone()), &config, harness.parts)
        .await
        .unwrap();

    wait_until(|| played.lock().len() == 2).await;

    let order: Vec<u64> = played.lock().iter().map(|(sequence, _, _)| *sequence).collect();
    assert_eq!(order, vec![0, 1]);

    let report = handle.shutdown().await.unwrap();
    assert_eq!(report.fragments_played, 2);
    assert_eq!(report.decode_failures, 0);
}

#[tokio::test]
async fn test_external_stop_sharing_ends_session() {
    let (endpoint, mut received) = mock_service(Vec::new(), false).await;
    let config = config_for(endpoint, 5_000);
    let harness = harness();

    let slot = SessionSlot::new();
    let handle = slot
        .start(CaptureSession::new(31, config.session.clone()), &config, harness.parts)
        .await
        .unwrap();

    // Handshake, then the first frame one interval later
    received.recv().await.unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(10), received.recv())
        .await
        .expect("no frame within one interval")
        .unwrap();
    let frame: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(frame["type"], "frame");
    let jpeg = STANDARD.decode(frame["frame"].as_str().unwrap()).unwrap();
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

    // The user stops sharing from outside the app; nobody calls stop()
    harness.ended.store(true, Ordering::SeqCst);

    let report = tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("session did not end")
        .unwrap();
    assert_eq!(report.end_reason, EndReason::SourceEnded);
    assert!(report.frames_dispatched >= 1);
    assert!(harness.stopped.load(Ordering::SeqCst));
    assert!(!slot.is_active());
}

#[tokio::test]
async fn test_server_close_ends_session() {
    let (endpoint, _received) = mock_service(Vec::new(), true).await;
    let config = config_for(endpoint, 10_000);
    let harness = harness();

    let slot = SessionSlot::new();
    let handle = slot
        .start(CaptureSession::new(41, config.session.clone()), &config, harness.parts)
        .await
        .unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .expect("session did not end")
        .unwrap();
    assert_eq!(report.end_reason, EndReason::TransportClosed);
    assert!(!report.end_reason.is_normal());
    assert!(harness.stopped.load(Ordering::SeqCst));
}
