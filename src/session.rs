//! Capture session lifecycle
//!
//! A session wires the two data paths together on one task:
//!
//! ```text
//!  outbound   CaptureScheduler tick ─▶ FrameSampler snapshot ─▶ StreamTransport
//!  inbound    StreamTransport audio ─▶ AudioDecodeQueue ─▶ PlaybackScheduler ─▶ sink
//! ```
//!
//! Every event source (ticks, transport, decode completions, playback
//! completions, source end, stop requests) is awaited by a single
//! `select!` loop, so each handler runs to completion and the pipeline
//! state needs no locks. Only one session may be active at a time.

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use crate::audio::playback::{AudioSink, PlaybackEvent, PlaybackScheduler, PlaybackStats};
use crate::audio::queue::{AudioDecodeQueue, DecodeOutcome, QueueStats};
use crate::capture::sampler::{FrameSampler, SnapshotReceiver};
use crate::capture::scheduler::{CaptureScheduler, FrameTick};
use crate::capture::source::ScreenProvider;
use crate::codec::audio::FragmentDecoder;
use crate::config::{validate_capture_interval, AppConfig, SessionPreferences};
use crate::error::{Result, SessionError};
use crate::network::transport::{
    StreamTransport, TransportEvent, TransportEvents, TransportState, TransportStats,
};

/// One screen-share-to-commentary session
#[derive(Debug, Clone, Serialize)]
pub struct CaptureSession {
    /// Identifier issued by the session service
    pub id: u64,
    pub preferences: SessionPreferences,
    pub started_at: DateTime<Utc>,
}

impl CaptureSession {
    pub fn new(id: u64, preferences: SessionPreferences) -> Self {
        Self {
            id,
            preferences,
            started_at: Utc::now(),
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EndReason {
    /// Stop was requested
    Stopped,
    /// The user stopped sharing from outside the app
    SourceEnded,
    /// The server closed the channel
    TransportClosed,
    /// The channel broke or never became ready
    TransportFailed(String),
}

impl EndReason {
    /// Whether the session ended without an error
    pub fn is_normal(&self) -> bool {
        matches!(self, EndReason::Stopped | EndReason::SourceEnded)
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Stopped => write!(f, "stopped"),
            EndReason::SourceEnded => write!(f, "screen sharing ended"),
            EndReason::TransportClosed => write!(f, "connection closed by server"),
            EndReason::TransportFailed(e) => write!(f, "connection failed: {}", e),
        }
    }
}

/// Summary produced when a session ends
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: u64,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub frames_rendered: u64,
    /// Scheduler ticks, each one an attempt to send a frame
    pub frames_dispatched: u64,
    pub frames_sent: u64,
    /// Ticks whose frame was dropped (busy, not ready, or no snapshot yet)
    pub frames_dropped: u64,
    pub fragments_received: u64,
    pub fragments_played: u64,
    pub fragments_evicted: u64,
    /// Audio fragments that could not be decoded
    pub decode_failures: u64,
    /// Inbound messages that were not valid protocol messages
    pub invalid_messages: u64,
    pub end_reason: EndReason,
}

/// Live view of a running session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: u64,
    pub active: bool,
    pub transport_state: TransportState,
    pub frames_rendered: u64,
    pub frames_dispatched: u64,
    pub transport: TransportStats,
    pub queue: QueueStats,
    pub playback: PlaybackStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
}

/// Platform pieces a session runs on
pub struct PipelineParts {
    pub screen: Arc<dyn ScreenProvider>,
    pub decoder: Arc<dyn FragmentDecoder>,
    pub sink: Box<dyn AudioSink>,
    /// Completion events the sink reports on
    pub playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
}

/// Requests a session to stop; cheap to clone
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<Notify>);

impl StopHandle {
    pub(crate) fn new(signal: Arc<Notify>) -> Self {
        Self(signal)
    }

    /// Ask the session to stop. Idempotent.
    pub fn stop(&self) {
        self.0.notify_one();
    }
}

/// Guards the single active session
#[derive(Debug, Clone, Default)]
pub struct SessionSlot {
    active: Arc<Mutex<Option<u64>>>,
}

/// Holds the slot until the session task finishes
pub(crate) struct SlotGuard {
    active: Arc<Mutex<Option<u64>>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        *self.active.lock() = None;
    }
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the running session, if any
    pub fn active_session(&self) -> Option<u64> {
        *self.active.lock()
    }

    pub fn is_active(&self) -> bool {
        self.active_session().is_some()
    }

    pub(crate) fn claim(&self, session_id: u64) -> std::result::Result<SlotGuard, SessionError> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(SessionError::AlreadyActive);
        }
        *active = Some(session_id);
        Ok(SlotGuard {
            active: self.active.clone(),
        })
    }

    /// Start a session: acquire the screen, connect and handshake, then
    /// run the pipeline until stopped.
    ///
    /// Acquisition and connection errors are returned here and release
    /// everything acquired so far.
    pub async fn start(
        &self,
        session: CaptureSession,
        config: &AppConfig,
        parts: PipelineParts,
    ) -> Result<SessionHandle> {
        validate_capture_interval(session.preferences.capture_interval)?;
        let guard = self.claim(session.id)?;

        tracing::info!(
            "Starting session {} ({} ms interval)",
            session.id,
            session.preferences.capture_interval
        );

        let mut sampler = FrameSampler::acquire(parts.screen, &config.capture).await?;
        let preview = sampler.subscribe();

        let mut transport = StreamTransport::new(config.network.clone());
        let events = match transport.connect(session.id, &session.preferences).await {
            Ok(events) => events,
            Err(e) => {
                sampler.release().await;
                return Err(e.into());
            }
        };

        let mut scheduler = CaptureScheduler::new();
        let ticks = match scheduler.start(session.preferences.capture_interval()) {
            Ok(ticks) => ticks,
            Err(e) => {
                transport.disconnect();
                sampler.release().await;
                return Err(e);
            }
        };

        let queue = AudioDecodeQueue::new(parts.decoder, config.playback.queue_depth);
        let playback = PlaybackScheduler::new(parts.sink);

        let stop = Arc::new(Notify::new());
        let (status_tx, status) = watch::channel(SessionStatus {
            session_id: session.id,
            active: true,
            transport_state: transport.state(),
            frames_rendered: 0,
            frames_dispatched: 0,
            transport: TransportStats::default(),
            queue: QueueStats::default(),
            playback: PlaybackStats::default(),
            end_reason: None,
        });
        let pipeline = Pipeline {
            session: session.clone(),
            started: Instant::now(),
            sampler,
            scheduler,
            transport,
            queue,
            playback,
            frames_dispatched: 0,
            frames_without_snapshot: 0,
            status_tx,
        };

        let task = tokio::spawn(pipeline.run(
            PipelineInputs {
                ticks,
                events,
                playback_events: parts.playback_events,
                stop: stop.clone(),
                ready_timeout: config.network.ready_timeout(),
            },
            guard,
        ));

        Ok(SessionHandle {
            session,
            stop: StopHandle::new(stop),
            status,
            preview,
            task,
        })
    }
}

/// Handle to a running session
pub struct SessionHandle {
    session: CaptureSession,
    stop: StopHandle,
    status: watch::Receiver<SessionStatus>,
    preview: SnapshotReceiver,
    task: JoinHandle<SessionReport>,
}

impl SessionHandle {
    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    /// Request an orderly stop; `join` returns the report
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Live status, updated after every pipeline event
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Latest rendered snapshot, for previews
    pub fn preview(&self) -> SnapshotReceiver {
        self.preview.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session to end
    pub async fn join(self) -> Result<SessionReport> {
        self.task
            .await
            .map_err(|e| SessionError::TaskFailed(e.to_string()).into())
    }

    /// Stop and wait for the report
    pub async fn shutdown(self) -> Result<SessionReport> {
        self.stop();
        self.join().await
    }
}

struct PipelineInputs {
    ticks: mpsc::Receiver<FrameTick>,
    events: TransportEvents,
    playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
    stop: Arc<Notify>,
    ready_timeout: Duration,
}

/// Everything a running session owns
struct Pipeline {
    session: CaptureSession,
    started: Instant,
    sampler: FrameSampler,
    scheduler: CaptureScheduler,
    transport: StreamTransport,
    queue: AudioDecodeQueue,
    playback: PlaybackScheduler,
    frames_dispatched: u64,
    frames_without_snapshot: u64,
    status_tx: watch::Sender<SessionStatus>,
}

impl Pipeline {
    async fn run(mut self, inputs: PipelineInputs, _slot: SlotGuard) -> SessionReport {
        let PipelineInputs {
            mut ticks,
            mut events,
            mut playback_events,
            stop,
            ready_timeout,
        } = inputs;

        let source_ended = self.sampler.source_ended();
        let ready_deadline = tokio::time::sleep(ready_timeout);
        tokio::pin!(ready_deadline);
        let mut ready = false;

        let reason = loop {
            tokio::select! {
                _ = stop.notified() => break EndReason::Stopped,

                _ = source_ended.notified() => break EndReason::SourceEnded,

                Some(tick) = ticks.recv() => self.dispatch_frame(tick),

                event = events.recv() => match event {
                    Some(TransportEvent::Ready) => ready = true,
                    Some(TransportEvent::Audio(bytes)) => {
                        self.queue.enqueue(bytes);
                    }
                    Some(TransportEvent::Closed(_)) | None => break EndReason::TransportClosed,
                    Some(TransportEvent::Failed(e)) => break EndReason::TransportFailed(e.to_string()),
                },

                Some(outcome) = self.queue.next_decoded(), if self.queue.has_pending() => {
                    self.on_decoded(outcome);
                }

                Some(PlaybackEvent::Finished { sequence }) = playback_events.recv() => {
                    self.playback.on_finished(sequence, &mut self.queue);
                }

                _ = &mut ready_deadline, if !ready => {
                    break EndReason::TransportFailed(format!(
                        "server did not acknowledge the handshake within {:?}",
                        ready_timeout
                    ));
                }
            }

            self.publish_status(None);
        };

        self.shutdown(reason).await
    }

    /// Send the current snapshot for one tick
    fn dispatch_frame(&mut self, tick: FrameTick) {
        self.frames_dispatched += 1;

        match self.sampler.current_snapshot() {
            Some(snapshot) => {
                if self.transport.send_frame(&snapshot.base64) {
                    tracing::debug!(
                        "Tick {}: sent snapshot {} ({} bytes)",
                        tick.sequence,
                        snapshot.sequence,
                        snapshot.jpeg.len()
                    );
                } else {
                    tracing::debug!("Tick {}: frame dropped", tick.sequence);
                }
            }
            None => {
                self.frames_without_snapshot += 1;
                tracing::debug!("Tick {}: no snapshot rendered yet", tick.sequence);
            }
        }
    }

    /// Apply a decode, plus any others already finished, then kick playback
    fn on_decoded(&mut self, outcome: DecodeOutcome) {
        let mut appended = self.queue.complete(outcome);

        while let Some(Some(outcome)) = self.queue.next_decoded().now_or_never() {
            appended |= self.queue.complete(outcome);
        }

        if appended {
            self.playback.on_enqueued(&mut self.queue);
        }
    }

    fn publish_status(&self, end_reason: Option<EndReason>) {
        self.status_tx.send_replace(SessionStatus {
            session_id: self.session.id,
            active: end_reason.is_none(),
            transport_state: self.transport.state(),
            frames_rendered: self.sampler.frames_rendered(),
            frames_dispatched: self.frames_dispatched,
            transport: self.transport.stats(),
            queue: self.queue.stats(),
            playback: self.playback.stats(),
            end_reason,
        });
    }

    /// Tear down in dependency order: stop inbound audio first so nothing
    /// lands in the queue mid-teardown
    async fn shutdown(mut self, reason: EndReason) -> SessionReport {
        tracing::info!("Session {} ending: {}", self.session.id, reason);

        self.transport.disconnect();
        self.queue.clear();
        self.playback.reset();
        self.scheduler.stop();
        self.sampler.release().await;

        let transport = self.transport.stats();
        let queue = self.queue.stats();
        let playback = self.playback.stats();

        let report = SessionReport {
            session_id: self.session.id,
            started_at: self.session.started_at,
            duration_secs: self.started.elapsed().as_secs_f64(),
            frames_rendered: self.sampler.frames_rendered(),
            frames_dispatched: self.frames_dispatched,
            frames_sent: transport.frames_sent,
            frames_dropped: transport.frames_dropped
                + transport.frames_skipped
                + self.frames_without_snapshot,
            fragments_received: transport.audio_received,
            fragments_played: playback.played,
            fragments_evicted: queue.evicted,
            decode_failures: queue.failed + transport.invalid_audio,
            invalid_messages: transport.invalid_messages,
            end_reason: reason.clone(),
        };

        self.publish_status(Some(reason));

        tracing::info!(
            "Session {} ended after {:.1}s: {} frames sent, {} dropped, {} fragments played",
            report.session_id,
            report.duration_secs,
            report.frames_sent,
            report.frames_dropped,
            report.fragments_played
        );

        report
    }
}
