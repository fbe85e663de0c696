//! # Screen Commentary Client
//!
//! Shares the screen with a remote commentary service and plays the spoken
//! commentary it sends back, gaplessly and in near real time.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── CLIENT ────────────────────────────────────┐
//! │                                                                            │
//! │  ┌──────────────┐  render loop   ┌───────────────┐    preview (ui::server)  │
//! │  │ ScreenSource │ ─────────────▶ │ FrameSampler  │ ──────────────────────▶  │
//! │  │   (xcap)     │   every vsync  │ latest JPEG   │                          │
//! │  └──────────────┘                └───────┬───────┘                          │
//! │                                          │ current_snapshot()               │
//! │  ┌──────────────────┐  tick every        ▼                                  │
//! │  │ CaptureScheduler │ ─────────▶ ┌───────────────────────────────────┐      │
//! │  │  5 s .. 30 s     │  interval  │          StreamTransport          │      │
//! │  └──────────────────┘            │  Idle→Connecting→HandshakeSent    │      │
//! │                                  │       →Ready→Closed               │      │
//! │                                  └──────┬─────────────────▲──────────┘      │
//! │                                         │ audio bytes     │ frame / init    │
//! │                                         ▼                 │                 │
//! │  ┌──────────────────┐          ┌──────────────────┐       │                 │
//! │  │ PlaybackScheduler│ ◀─────── │ AudioDecodeQueue │       │                 │
//! │  │ cursor = max(now,│  oldest  │ depth 2, evicts  │       │                 │
//! │  │   cursor) + dur  │  first   │ oldest           │       │                 │
//! │  └────────┬─────────┘          └──────────────────┘       │                 │
//! │           ▼                                               │                 │
//! │  ┌──────────────────┐                                     │                 │
//! │  │ AudioOutput cpal │  audio clock                        │                 │
//! │  └──────────────────┘                                     │                 │
//! └───────────────────────────────────────────────────────────┼─────────────────┘
//!                                                             │ WebSocket
//!                                                             ▼
//!                                                   remote commentary service
//! ```

pub mod audio;
pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;
pub mod ui;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Shortest allowed interval between transmitted frames
    pub const MIN_CAPTURE_INTERVAL_MS: u64 = 5_000;

    /// Longest allowed interval between transmitted frames
    pub const MAX_CAPTURE_INTERVAL_MS: u64 = 30_000;

    /// Default interval between transmitted frames
    pub const DEFAULT_CAPTURE_INTERVAL_MS: u64 = 10_000;

    /// Maximum decoded fragments waiting to play
    pub const DEFAULT_QUEUE_DEPTH: usize = 2;

    /// Default commentary service endpoint
    pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8000";

    /// Default voice for the first speaker
    pub const DEFAULT_SPEAKER1_VOICE_ID: &str = "qVpGLzi5EhjW3WGVhOa9";

    /// Preview render rate
    pub const DEFAULT_RENDER_FPS: u32 = 30;

    /// JPEG quality for sampled frames (0-100)
    pub const DEFAULT_JPEG_QUALITY: u8 = 80;

    /// Default port for the preview/status server
    pub const DEFAULT_UI_PORT: u16 = 8090;
}
