//! Gapless playback scheduling
//!
//! Exactly one fragment is scheduled or playing at any time. When it
//! finishes (or when the queue becomes non-empty while idle) the next
//! fragment is placed at `max(clock_now, cursor)` and the cursor advances by
//! its duration, so fragments play back-to-back without overlap.
//!
//! ```text
//!  clock ───────────────────────────────────────────────────────▶
//!         │ fragment 1  │ fragment 2      │      │ fragment 3 │
//!         ▲             ▲                 ▲      ▲
//!       start        cursor            cursor  start = now (queue ran dry)
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::audio::clock::AudioClock;
use crate::audio::queue::{AudioDecodeQueue, AudioFragment};
use crate::error::AudioError;

/// Completion signals sent by an output sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The last sample of this fragment has been rendered
    Finished { sequence: u64 },
}

/// Sender half handed to an [`AudioSink`]
pub type PlaybackNotifier = mpsc::UnboundedSender<PlaybackEvent>;

/// Create the channel a sink reports completions on
pub fn playback_channel() -> (PlaybackNotifier, mpsc::UnboundedReceiver<PlaybackEvent>) {
    mpsc::unbounded_channel()
}

/// Output that can start a buffer at a given audio clock position
pub trait AudioSink: Send {
    /// The clock `schedule` positions are expressed in
    fn clock(&self) -> Arc<dyn AudioClock>;

    /// Start `fragment` at `start_at`. The sink must send
    /// [`PlaybackEvent::Finished`] once it has played out.
    fn schedule(&mut self, fragment: AudioFragment, start_at: Duration) -> Result<(), AudioError>;

    /// Discard everything scheduled or playing, without completion events
    fn cancel_all(&mut self);
}

/// What was handed to the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledFragment {
    pub sequence: u64,
    pub start_at: Duration,
    pub ends_at: Duration,
}

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Scheduled(ScheduledFragment),
}

/// Drains the decode queue onto the sink back-to-back
pub struct PlaybackScheduler {
    sink: Box<dyn AudioSink>,
    clock: Arc<dyn AudioClock>,
    /// Earliest clock position the next fragment may start at
    cursor: Duration,
    state: PlaybackState,
    played: u64,
    gaps: u64,
    sink_errors: u64,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn AudioSink>) -> Self {
        let clock = sink.clock();
        Self {
            sink,
            clock,
            cursor: Duration::ZERO,
            state: PlaybackState::Idle,
            played: 0,
            gaps: 0,
            sink_errors: 0,
        }
    }

    /// The queue gained a fragment; start playing if idle
    pub fn on_enqueued(&mut self, queue: &mut AudioDecodeQueue) -> Option<ScheduledFragment> {
        match self.state {
            PlaybackState::Idle => self.schedule_next(queue),
            PlaybackState::Scheduled(_) => None,
        }
    }

    /// The sink finished a fragment; chain the next one
    pub fn on_finished(
        &mut self,
        sequence: u64,
        queue: &mut AudioDecodeQueue,
    ) -> Option<ScheduledFragment> {
        match self.state {
            PlaybackState::Scheduled(current) if current.sequence == sequence => {
                self.state = PlaybackState::Idle;
                self.schedule_next(queue)
            }
            // Completion for something cancelled by a reset
            _ => {
                tracing::trace!("Ignoring stale completion for fragment {}", sequence);
                None
            }
        }
    }

    fn schedule_next(&mut self, queue: &mut AudioDecodeQueue) -> Option<ScheduledFragment> {
        loop {
            let fragment = queue.dequeue_next()?;
            let now = self.clock.now();
            let start_at = now.max(self.cursor);

            if self.played > 0 && start_at > self.cursor {
                self.gaps += 1;
            }

            let scheduled = ScheduledFragment {
                sequence: fragment.sequence,
                start_at,
                ends_at: start_at + fragment.duration(),
            };

            match self.sink.schedule(fragment, start_at) {
                Ok(()) => {
                    self.cursor = scheduled.ends_at;
                    self.state = PlaybackState::Scheduled(scheduled);
                    self.played += 1;
                    tracing::debug!(
                        "Fragment {} scheduled at {:.3}s (queue: {})",
                        scheduled.sequence,
                        start_at.as_secs_f64(),
                        queue.len()
                    );
                    return Some(scheduled);
                }
                Err(e) => {
                    self.sink_errors += 1;
                    tracing::warn!("Output rejected fragment {}: {}", scheduled.sequence, e);
                }
            }
        }
    }

    /// Cancel pending playback and rewind the cursor
    pub fn reset(&mut self) {
        self.sink.cancel_all();
        self.cursor = Duration::ZERO;
        self.state = PlaybackState::Idle;
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn cursor(&self) -> Duration {
        self.cursor
    }

    pub fn stats(&self) -> PlaybackStats {
        PlaybackStats {
            played: self.played,
            gaps: self.gaps,
            sink_errors: self.sink_errors,
            cursor_secs: self.cursor.as_secs_f64(),
        }
    }
}

/// Playback statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PlaybackStats {
    /// Fragments handed to the output
    pub played: u64,
    /// Times the queue ran dry between fragments
    pub gaps: u64,
    pub sink_errors: u64,
    pub cursor_secs: f64,
}
