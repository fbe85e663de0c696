//! Frame sampler
//!
//! Renders the live screen source into a JPEG snapshot as fast as the
//! render rate allows, independently of how often frames are transmitted.
//! The latest snapshot is published through a `watch` channel; every render
//! overwrites it unconditionally.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Notify};

use crate::capture::source::{ScreenProvider, ScreenSource};
use crate::codec::jpeg::SnapshotEncoder;
use crate::config::CaptureConfig;
use crate::error::CaptureError;

/// The most recent rendered frame
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Increases by one per rendered frame
    pub sequence: u64,
    /// Base64 JPEG, no MIME prefix
    pub base64: Arc<str>,
    pub jpeg: Bytes,
    pub width: u32,
    pub height: u32,
    pub rendered_at: Instant,
}

/// Shared handle to the latest snapshot
pub type SnapshotReceiver = watch::Receiver<Option<Arc<Snapshot>>>;

/// Keeps a continuously updated snapshot of the screen
pub struct FrameSampler {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    snapshot_rx: SnapshotReceiver,
    ended: Arc<Notify>,
    frames_rendered: Arc<AtomicU64>,
    source_name: String,
}

impl FrameSampler {
    /// Acquire a screen source and start the render loop.
    ///
    /// Waits while the platform asks the user for permission. Fails with
    /// [`CaptureError::Denied`] or [`CaptureError::Unavailable`].
    pub async fn acquire(
        provider: Arc<dyn ScreenProvider>,
        config: &CaptureConfig,
    ) -> Result<Self, CaptureError> {
        let running = Arc::new(AtomicBool::new(true));
        let ended = Arc::new(Notify::new());
        let frames_rendered = Arc::new(AtomicU64::new(0));
        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<String, CaptureError>>();

        let encoder = SnapshotEncoder::new(config.jpeg_quality, config.max_width, config.max_height);
        let period = config.render_period();
        let render_loop = RenderLoop {
            running: running.clone(),
            ended: ended.clone(),
            frames_rendered: frames_rendered.clone(),
            snapshot_tx,
            encoder,
            period,
        };

        let handle = thread::Builder::new()
            .name("frame-sampler".to_string())
            .spawn(move || {
                let source = match provider.acquire() {
                    Ok(source) => {
                        let _ = ready_tx.send(Ok(source.describe()));
                        source
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                render_loop.run(source);
            })
            .map_err(|e| CaptureError::Backend(e.to_string()))?;

        let source_name = match ready_rx.await {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                running.store(false, Ordering::SeqCst);
                join_render_thread(handle).await;
                return Err(e);
            }
            Err(_) => {
                join_render_thread(handle).await;
                return Err(CaptureError::Backend("Sampler thread exited".to_string()));
            }
        };

        tracing::info!("Frame sampler started on {} ({:?} per render)", source_name, period);

        Ok(Self {
            running,
            thread_handle: Some(handle),
            snapshot_rx,
            ended,
            frames_rendered,
            source_name,
        })
    }

    /// Latest snapshot, if one has been rendered. Never blocks.
    pub fn current_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot_rx.borrow().clone()
    }

    /// Receiver that observes every snapshot replacement, for previews
    pub fn subscribe(&self) -> SnapshotReceiver {
        self.snapshot_rx.clone()
    }

    /// Notified once when the source ends on its own
    pub fn source_ended(&self) -> Arc<Notify> {
        self.ended.clone()
    }

    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Stop the render loop and release the source. Idempotent.
    ///
    /// Waits for the render in progress off the async worker.
    pub async fn release(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            join_render_thread(handle).await;
            tracing::info!(
                "Frame sampler released after {} frames",
                self.frames_rendered()
            );
        }
    }
}

impl Drop for FrameSampler {
    fn drop(&mut self) {
        // The render thread stops the source on its way out
        self.running.store(false, Ordering::SeqCst);
        self.thread_handle.take();
    }
}

async fn join_render_thread(handle: JoinHandle<()>) {
    match tokio::task::spawn_blocking(move || handle.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => tracing::error!("Frame sampler thread panicked"),
        Err(e) => tracing::warn!("Failed to join frame sampler thread: {}", e),
    }
}

struct RenderLoop {
    running: Arc<AtomicBool>,
    ended: Arc<Notify>,
    frames_rendered: Arc<AtomicU64>,
    snapshot_tx: watch::Sender<Option<Arc<Snapshot>>>,
    encoder: SnapshotEncoder,
    period: Duration,
}

impl RenderLoop {
    fn run(self, mut source: Box<dyn ScreenSource>) {
        let mut sequence = 0u64;
        let mut next_frame = Instant::now();
        let mut source_ended = false;

        while self.running.load(Ordering::Relaxed) {
            match source.grab() {
                Ok(image) => match self.encoder.encode(&image) {
                    Ok(encoded) => {
                        sequence += 1;
                        self.frames_rendered.fetch_add(1, Ordering::Relaxed);
                        self.snapshot_tx.send_replace(Some(Arc::new(Snapshot {
                            sequence,
                            base64: Arc::from(encoded.base64),
                            jpeg: Bytes::from(encoded.jpeg),
                            width: encoded.width,
                            height: encoded.height,
                            rendered_at: Instant::now(),
                        })));
                    }
                    Err(e) => tracing::warn!("Snapshot encoding failed: {}", e),
                },
                Err(CaptureError::SourceEnded) => {
                    tracing::info!("Screen source ended: {}", source.describe());
                    self.running.store(false, Ordering::SeqCst);
                    source_ended = true;
                    break;
                }
                Err(e) => tracing::debug!("Frame grab skipped: {}", e),
            }

            next_frame += self.period;
            let now = Instant::now();
            if next_frame > now {
                thread::sleep(next_frame - now);
            } else {
                // Running behind; render again immediately
                next_frame = now;
            }
        }

        // Same teardown for release() and an externally ended source
        source.stop();
        if source_ended {
            self.ended.notify_one();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    /// Produces `frames` solid frames, then reports the source as ended
    pub(crate) struct FakeScreen {
        pub frames: Option<u64>,
        pub deny: bool,
        pub stopped: Arc<AtomicBool>,
        /// Time each grab takes
        pub grab_delay: Duration,
    }

    impl FakeScreen {
        pub(crate) fn endless() -> Self {
            Self {
                frames: None,
                deny: false,
                stopped: Arc::new(AtomicBool::new(false)),
                grab_delay: Duration::ZERO,
            }
        }
    }

    struct FakeSource {
        remaining: Option<u64>,
        stopped: Arc<AtomicBool>,
        grab_delay: Duration,
    }

    impl ScreenProvider for FakeScreen {
        fn acquire(&self) -> Result<Box<dyn ScreenSource>, CaptureError> {
            if self.deny {
                return Err(CaptureError::Denied("user refused".into()));
            }
            Ok(Box::new(FakeSource {
                remaining: self.frames,
                stopped: self.stopped.clone(),
                grab_delay: self.grab_delay,
            }))
        }
    }

    impl ScreenSource for FakeSource {
        fn grab(&mut self) -> Result<RgbaImage, CaptureError> {
            thread::sleep(self.grab_delay);
            match self.remaining.as_mut() {
                Some(0) => Err(CaptureError::SourceEnded),
                Some(n) => {
                    *n -= 1;
                    Ok(RgbaImage::from_pixel(16, 9, Rgba([0, 128, 255, 255])))
                }
                None => Ok(RgbaImage::from_pixel(16, 9, Rgba([0, 128, 255, 255]))),
            }
        }

        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn describe(&self) -> String {
            "fake screen".to_string()
        }
    }

    fn fast_config() -> CaptureConfig {
        CaptureConfig {
            render_fps: 200,
            ..CaptureConfig::default()
        }
    }

    #[tokio::test]
    async fn test_denied_acquire_fails() {
        let provider = FakeScreen {
            deny: true,
            ..FakeScreen::endless()
        };
        let result = FrameSampler::acquire(Arc::new(provider), &fast_config()).await;
        assert!(matches!(result, Err(CaptureError::Denied(_))));
    }

    #[tokio::test]
    async fn test_snapshots_advance_and_release_is_idempotent() {
        let provider = FakeScreen::endless();
        let stopped = provider.stopped.clone();
        let mut sampler = FrameSampler::acquire(Arc::new(provider), &fast_config())
            .await
            .unwrap();

        let mut updates = sampler.subscribe();
        updates.changed().await.unwrap();
        updates.changed().await.unwrap();

        let snapshot = sampler.current_snapshot().unwrap();
        assert!(snapshot.sequence >= 2);
        assert_eq!((snapshot.width, snapshot.height), (16, 9));

        sampler.release().await;
        sampler.release().await;
        assert!(!sampler.is_active());
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_release_does_not_stall_runtime() {
        let provider = FakeScreen {
            grab_delay: Duration::from_millis(300),
            ..FakeScreen::endless()
        };
        let stopped = provider.stopped.clone();
        let mut sampler = FrameSampler::acquire(Arc::new(provider), &fast_config())
            .await
            .unwrap();

        // Single-threaded runtime: this only runs if release yields
        let ran = Arc::new(AtomicBool::new(false));
        let other = tokio::spawn({
            let ran = ran.clone();
            async move { ran.store(true, Ordering::SeqCst) }
        });

        sampler.release().await;

        assert!(ran.load(Ordering::SeqCst));
        other.await.unwrap();
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_source_end_tears_down_and_notifies() {
        let provider = FakeScreen {
            frames: Some(3),
            ..FakeScreen::endless()
        };
        let stopped = provider.stopped.clone();
        let sampler = FrameSampler::acquire(Arc::new(provider), &fast_config())
            .await
            .unwrap();

        let ended = sampler.source_ended();
        tokio::time::timeout(Duration::from_secs(5), ended.notified())
            .await
            .expect("source end was not signalled");

        assert!(!sampler.is_active());
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(sampler.current_snapshot().unwrap().sequence, 3);
    }
}
