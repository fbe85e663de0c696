//! Duplex session channel
//!
//! One WebSocket per session. Outbound traffic is the `init` handshake
//! followed by best-effort `frame` messages; inbound traffic is demultiplexed
//! into [`TransportEvent`]s for the session loop.
//!
//! ```text
//!  Idle ──connect──▶ Connecting ──open + init──▶ HandshakeSent ──ready──▶ Ready
//!                        │                             │                    │
//!                        └──────── error / close / disconnect ──────────────┴──▶ Closed
//! ```
//!
//! Frames are never queued: while one frame is being written any further
//! frame is dropped, since a stale frame has no value once a fresher one
//! exists. There is no automatic reconnect.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::codec::audio::decode_base64;
use crate::config::{NetworkConfig, SessionPreferences};
use crate::error::TransportError;
use crate::protocol::{ClientMessage, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Idle,
    Connecting,
    HandshakeSent,
    Ready,
    Closed,
}

/// Inbound traffic and connection changes, in arrival order
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The server acknowledged the handshake
    Ready,
    /// Raw bytes of one audio fragment
    Audio(Vec<u8>),
    /// The server closed the channel
    Closed(Option<String>),
    /// The channel broke
    Failed(TransportError),
}

/// Receiver for [`TransportEvent`]s
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Transport statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportStats {
    pub frames_sent: u64,
    /// Dropped because the previous frame was still being written
    pub frames_dropped: u64,
    /// Dropped because the channel was not ready
    pub frames_skipped: u64,
    pub audio_received: u64,
    /// Audio messages whose payload was not valid base64
    pub invalid_audio: u64,
    /// Messages that did not parse at all
    pub invalid_messages: u64,
}

/// State shared with the reader and writer tasks
struct Shared {
    state: watch::Sender<TransportState>,
    in_flight: AtomicBool,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    frames_skipped: AtomicU64,
    audio_received: AtomicU64,
    invalid_audio: AtomicU64,
    invalid_messages: AtomicU64,
}

impl Shared {
    /// Move to `Closed`; true only for the caller that made the transition
    fn mark_closed(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == TransportState::Closed {
                false
            } else {
                *state = TransportState::Closed;
                true
            }
        })
    }

    fn mark_ready(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == TransportState::HandshakeSent {
                *state = TransportState::Ready;
                true
            } else {
                false
            }
        })
    }
}

/// Owns the session's duplex channel
pub struct StreamTransport {
    config: NetworkConfig,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<TransportState>,
    frame_tx: Option<mpsc::Sender<String>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl StreamTransport {
    pub fn new(config: NetworkConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(TransportState::Idle);
        Self {
            config,
            shared: Arc::new(Shared {
                state: state_tx,
                in_flight: AtomicBool::new(false),
                frames_sent: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
                frames_skipped: AtomicU64::new(0),
                audio_received: AtomicU64::new(0),
                invalid_audio: AtomicU64::new(0),
                invalid_messages: AtomicU64::new(0),
            }),
            state_rx,
            frame_tx: None,
            reader: None,
            writer: None,
        }
    }

    /// Open the channel for `session_id` and send the handshake.
    ///
    /// Returns once the handshake is written; readiness arrives later as
    /// [`TransportEvent::Ready`]. Any failure leaves the transport `Closed`.
    pub async fn connect(
        &mut self,
        session_id: u64,
        preferences: &SessionPreferences,
    ) -> Result<TransportEvents, TransportError> {
        if self.state() != TransportState::Idle {
            return Err(TransportError::ConnectionFailed(format!(
                "transport is {:?}, not idle",
                self.state()
            )));
        }

        let url = self.config.session_url(session_id);
        self.shared.state.send_replace(TransportState::Connecting);
        tracing::info!("Connecting to {}", url);

        let connected =
            tokio::time::timeout(self.config.connect_timeout(), tokio_tungstenite::connect_async(url.as_str()))
                .await;
        let ws = match connected {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                self.shared.mark_closed();
                return Err(TransportError::ConnectionFailed(e.to_string()));
            }
            Err(_) => {
                self.shared.mark_closed();
                return Err(TransportError::ConnectionFailed(format!(
                    "timed out after {:?}",
                    self.config.connect_timeout()
                )));
            }
        };

        let (mut sink, stream) = ws.split();

        let init = ClientMessage::init(preferences.clone()).to_json();
        if let Err(e) = sink.send(Message::Text(init)).await {
            self.shared.mark_closed();
            return Err(TransportError::HandshakeFailed(e.to_string()));
        }
        self.shared.state.send_replace(TransportState::HandshakeSent);
        tracing::info!("Handshake sent for session {}", session_id);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::channel(1);

        self.reader = Some(tokio::spawn(read_loop(
            stream,
            self.shared.clone(),
            event_tx.clone(),
        )));
        self.writer = Some(tokio::spawn(write_loop(
            sink,
            frame_rx,
            self.shared.clone(),
            event_tx,
        )));
        self.frame_tx = Some(frame_tx);

        Ok(event_rx)
    }

    /// Wait until the server acknowledges the handshake
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut state_rx = self.state_rx.clone();
        let reached = tokio::time::timeout(
            timeout,
            state_rx.wait_for(|s| matches!(s, TransportState::Ready | TransportState::Closed)),
        )
        .await;

        match reached {
            Ok(Ok(state)) if *state == TransportState::Ready => Ok(()),
            Ok(_) => Err(TransportError::Closed(None)),
            Err(_) => Err(TransportError::HandshakeFailed(format!(
                "no ready acknowledgement within {:?}",
                timeout
            ))),
        }
    }

    /// Send one frame, best effort.
    ///
    /// Returns whether the frame was handed to the writer. Not ready, closed,
    /// or busy writing the previous frame all drop the frame silently.
    pub fn send_frame(&self, payload: &str) -> bool {
        if self.state() != TransportState::Ready {
            self.shared.frames_skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let Some(frame_tx) = self.frame_tx.as_ref() else {
            return false;
        };

        if self.shared.in_flight.swap(true, Ordering::AcqRel) {
            self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Frame dropped, previous frame still in flight");
            return false;
        }

        match frame_tx.try_send(ClientMessage::frame(payload).to_json()) {
            Ok(()) => true,
            Err(_) => {
                self.shared.in_flight.store(false, Ordering::Release);
                self.shared.frames_skipped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Close the channel. Safe before `connect` and when already closed.
    pub fn disconnect(&mut self) {
        if self.state() == TransportState::Idle {
            return;
        }
        let was_open = self.shared.mark_closed();

        // The writer sends a close frame once its queue is gone
        self.frame_tx = None;
        self.writer = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }

        if was_open {
            tracing::info!("Transport disconnected");
        }
    }

    pub fn state(&self) -> TransportState {
        *self.state_rx.borrow()
    }


    pub fn stats(&self) -> TransportStats {
        TransportStats {
            frames_sent: self.shared.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.shared.frames_dropped.load(Ordering::Relaxed),
            frames_skipped: self.shared.frames_skipped.load(Ordering::Relaxed),
            audio_received: self.shared.audio_received.load(Ordering::Relaxed),
            invalid_audio: self.shared.invalid_audio.load(Ordering::Relaxed),
            invalid_messages: self.shared.invalid_messages.load(Ordering::Relaxed),
        }
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty());
                if shared.mark_closed() {
                    tracing::info!("Server closed the channel: {:?}", reason);
                    let _ = events.send(TransportEvent::Closed(reason));
                }
                return;
            }
            // Pings are answered by tungstenite; binary frames are not part
            // of the protocol
            Ok(_) => continue,
            Err(e) => {
                if shared.mark_closed() {
                    tracing::warn!("Channel error: {}", e);
                    let _ = events.send(TransportEvent::Failed(TransportError::ConnectionFailed(
                        e.to_string(),
                    )));
                }
                return;
            }
        };

        match ServerMessage::parse(&text) {
            Ok(ServerMessage::Ready) => {
                if shared.mark_ready() {
                    tracing::info!("Server ready, streaming frames");
                    let _ = events.send(TransportEvent::Ready);
                }
            }
            Ok(ServerMessage::Audio { audio }) => match decode_base64(&audio) {
                Ok(bytes) => {
                    shared.audio_received.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Audio message received ({} bytes)", bytes.len());
                    let _ = events.send(TransportEvent::Audio(bytes));
                }
                Err(e) => {
                    shared.invalid_audio.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Skipping audio message: {}", e);
                }
            },
            Ok(ServerMessage::Unknown) => {
                tracing::debug!("Ignoring message: {}", text);
            }
            Err(e) => {
                shared.invalid_messages.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("{}", e);
            }
        }
    }

    if shared.mark_closed() {
        let _ = events.send(TransportEvent::Closed(None));
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut frames: mpsc::Receiver<String>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(frame) = frames.recv().await {
        let result = sink.send(Message::Text(frame)).await;
        shared.in_flight.store(false, Ordering::Release);

        match result {
            Ok(()) => {
                shared.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                if shared.mark_closed() {
                    tracing::warn!("Frame send failed: {}", e);
                    let _ = events.send(TransportEvent::Failed(TransportError::ConnectionFailed(
                        e.to_string(),
                    )));
                }
                return;
            }
        }
    }

    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    struct MockServer {
        endpoint: String,
        /// Every text message the server received, handshake first
        received: mpsc::UnboundedReceiver<String>,
    }

    /// Accepts one session, answers the handshake with `replies`, then
    /// records what the client sends. Closes right after the replies when
    /// `close` is set.
    async fn mock_server(replies: Vec<String>, close: bool) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, received) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();

            if let Some(Ok(Message::Text(init))) = ws.next().await {
                let _ = received_tx.send(init);
            }
            for reply in replies {
                ws.send(Message::Text(reply)).await.unwrap();
            }
            if close {
                let _ = ws.close(None).await;
                return;
            }
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Text(text) => {
                        let _ = received_tx.send(text);
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        MockServer {
            endpoint: format!("ws://{}", addr),
            received,
        }
    }

    fn transport_for(endpoint: &str) -> StreamTransport {
        StreamTransport::new(NetworkConfig {
            endpoint: endpoint.to_string(),
            connect_timeout_ms: 2_000,
            ready_timeout_ms: 2_000,
        })
    }

    fn preferences() -> SessionPreferences {
        SessionPreferences {
            speaker1_voice_id: "qVpGLzi5EhjW3WGVhOa9".to_string(),
            speaker2_voice_id: None,
            capture_interval: 10_000,
        }
    }

    async fn next_event(events: &mut TransportEvents) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no transport event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_send_and_disconnect_before_connect_are_noops() {
        let mut transport = transport_for("ws://127.0.0.1:1");
        assert!(!transport.send_frame("QUJD"));
        transport.disconnect();
        transport.disconnect();
        assert_eq!(transport.state(), TransportState::Idle);
        assert_eq!(transport.stats().frames_skipped, 1);
    }

    #[tokio::test]
    async fn test_handshake_then_ready_then_frames() {
        let mut server = mock_server(vec![r#"{"type":"ready"}"#.to_string()], false).await;
        let mut transport = transport_for(&server.endpoint);

        let mut events = transport.connect(7, &preferences()).await.unwrap();
        let init: serde_json::Value =
            serde_json::from_str(&server.received.recv().await.unwrap()).unwrap();
        assert_eq!(
            init,
            serde_json::json!({
                "type": "init",
                "preferences": {
                    "speaker1_voice_id": "qVpGLzi5EhjW3WGVhOa9",
                    "capture_interval": 10000
                }
            })
        );

        assert!(matches!(next_event(&mut events).await, TransportEvent::Ready));
        transport.wait_ready(Duration::from_secs(1)).await.unwrap();
        assert_eq!(transport.state(), TransportState::Ready);

        assert!(transport.send_frame("data:image/jpeg;base64,QUJD"));
        let frame: serde_json::Value =
            serde_json::from_str(&server.received.recv().await.unwrap()).unwrap();
        assert_eq!(frame, serde_json::json!({"type": "frame", "frame": "QUJD"}));

        transport.disconnect();
        assert_eq!(transport.state(), TransportState::Closed);
        assert!(!transport.send_frame("QUJD"));
    }

    #[tokio::test]
    async fn test_second_frame_dropped_while_first_in_flight() {
        let server = mock_server(vec![r#"{"type":"ready"}"#.to_string()], false).await;
        let mut transport = transport_for(&server.endpoint);
        let _events = transport.connect(1, &preferences()).await.unwrap();
        transport.wait_ready(Duration::from_secs(2)).await.unwrap();

        // No await in between, so the writer has not run yet
        assert!(transport.send_frame("Zmlyc3Q="));
        assert!(!transport.send_frame("c2Vjb25k"));
        assert_eq!(transport.stats().frames_dropped, 1);
    }

    #[tokio::test]
    async fn test_bad_messages_are_skipped() {
        let replies = vec![
            r#"{"type":"ready"}"#,
            r#"{"type":"audio","audio":"%%%"}"#,
            r#"{"type":"audio","audio":"AQID"}"#,
            r#"{"type":"transcript","text":"hello"}"#,
            "not json",
            r#"{"type":"audio","audio":"BAUG"}"#,
        ];
        let server = mock_server(replies.into_iter().map(String::from).collect(), false).await;
        let mut transport = transport_for(&server.endpoint);
        let mut events = transport.connect(2, &preferences()).await.unwrap();

        assert!(matches!(next_event(&mut events).await, TransportEvent::Ready));
        match next_event(&mut events).await {
            TransportEvent::Audio(bytes) => assert_eq!(bytes, vec![1, 2, 3]),
            other => panic!("unexpected event {:?}", other),
        }
        match next_event(&mut events).await {
            TransportEvent::Audio(bytes) => assert_eq!(bytes, vec![4, 5, 6]),
            other => panic!("unexpected event {:?}", other),
        }

        assert_eq!(transport.state(), TransportState::Ready);
        let stats = transport.stats();
        assert_eq!(stats.audio_received, 2);
        assert_eq!(stats.invalid_audio, 1);
        assert_eq!(stats.invalid_messages, 1);
    }

    #[tokio::test]
    async fn test_server_close_is_reported_once() {
        let server = mock_server(vec![r#"{"type":"ready"}"#.to_string()], true).await;
        let mut transport = transport_for(&server.endpoint);
        let mut events = transport.connect(3, &preferences()).await.unwrap();

        assert!(matches!(next_event(&mut events).await, TransportEvent::Ready));
        assert!(matches!(next_event(&mut events).await, TransportEvent::Closed(_)));
        assert_eq!(transport.state(), TransportState::Closed);
        assert!(!transport.send_frame("QUJD"));

        transport.disconnect();
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_failure_closes_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut transport = transport_for(&format!("ws://{}", addr));
        let result = transport.connect(4, &preferences()).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        assert_eq!(transport.state(), TransportState::Closed);
        assert!(transport
            .wait_ready(Duration::from_millis(100))
            .await
            .is_err());
    }
}
