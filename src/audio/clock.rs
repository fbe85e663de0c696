//! Audio clock
//!
//! Playback is scheduled against the output device's own timebase, the
//! number of sample frames it has rendered, rather than wall-clock timers
//! that drift relative to the hardware.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Monotonic playback timebase
pub trait AudioClock: Send + Sync {
    /// Current position of the clock since the output started
    fn now(&self) -> Duration;
}

/// Clock driven by the number of frames an output callback has rendered
#[derive(Debug, Clone)]
pub struct FrameClock {
    frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl FrameClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frames: Arc::new(AtomicU64::new(0)),
            sample_rate: sample_rate.max(1),
        }
    }

    /// Advance by `frames` rendered frames; called from the audio callback
    pub fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::Release);
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frame index corresponding to a clock position
    pub fn frame_at(&self, at: Duration) -> u64 {
        (at.as_secs_f64() * self.sample_rate as f64).round() as u64
    }
}

impl AudioClock for FrameClock {
    fn now(&self) -> Duration {
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }
}

/// Clock moved by hand, for offline runs and tests
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, at: Duration) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl AudioClock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}
