//! Transmission cadence
//!
//! Emits one [`FrameTick`] per interval while running. The cadence is
//! independent of the render loop: the sampler decides how fresh the
//! snapshot is, the scheduler decides how often it leaves the machine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::validate_capture_interval;
use crate::error::Result;

/// Ticks buffered for a slow consumer before further ticks are coalesced
const TICK_BUFFER: usize = 4;

/// "Transmit the current snapshot now"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTick {
    /// 1 for the first tick of a run
    pub sequence: u64,
}

/// Repeating frame-due timer
#[derive(Debug, Default)]
pub struct CaptureScheduler {
    task: Option<JoinHandle<()>>,
    ticks: Arc<AtomicU64>,
}

impl CaptureScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start ticking every `interval`. The first tick fires one full
    /// interval after the call. Restarting replaces the previous timer and
    /// resets the tick counter.
    pub fn start(&mut self, interval: Duration) -> Result<mpsc::Receiver<FrameTick>> {
        validate_capture_interval(interval.as_millis() as u64)?;
        self.stop();

        let (tick_tx, tick_rx) = mpsc::channel(TICK_BUFFER);
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = ticks.clone();
        let first_tick = Instant::now() + interval;

        let task = tokio::spawn(async move {
            let mut timer = time::interval_at(first_tick, interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                timer.tick().await;
                let sequence = counter.fetch_add(1, Ordering::SeqCst) + 1;

                match tick_tx.try_send(FrameTick { sequence }) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!("Tick {} coalesced, consumer is behind", sequence);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        });

        tracing::info!("Capture scheduler started ({} ms)", interval.as_millis());

        self.task = Some(task);
        self.ticks = ticks;
        Ok(tick_rx)
    }

    /// Cancel the timer. Safe to call repeatedly or before `start`.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::info!("Capture scheduler stopped after {} ticks", self.ticks());
        }
    }

    /// Ticks fired since the last `start`
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

impl Drop for CaptureScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
