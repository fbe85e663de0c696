//! Screen video sources
//!
//! A [`ScreenProvider`] acquires a live source; the source yields RGBA
//! frames until it ends. Sources are created and used on the render thread
//! only, so they need not be `Send`.

use image::RgbaImage;
use xcap::Monitor;

use crate::error::CaptureError;

/// A live screen video source
pub trait ScreenSource {
    /// Grab the current frame. Returns [`CaptureError::SourceEnded`] once
    /// the source has gone away; other errors skip a single frame.
    fn grab(&mut self) -> Result<RgbaImage, CaptureError>;

    /// Stop the underlying tracks. Idempotent.
    fn stop(&mut self);

    fn describe(&self) -> String;
}

/// Grants access to a screen source
pub trait ScreenProvider: Send + Sync + 'static {
    /// May block while the platform asks the user for permission
    fn acquire(&self) -> Result<Box<dyn ScreenSource>, CaptureError>;
}

/// Consecutive failed grabs after which a monitor is treated as gone
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Captures a whole monitor through xcap
#[derive(Debug, Clone, Default)]
pub struct MonitorProvider {
    /// Monitor name; primary monitor when `None`
    pub monitor: Option<String>,
}

impl MonitorProvider {
    pub fn new(monitor: Option<String>) -> Self {
        Self { monitor }
    }
}

impl ScreenProvider for MonitorProvider {
    fn acquire(&self) -> Result<Box<dyn ScreenSource>, CaptureError> {
        let monitors = Monitor::all().map_err(|e| CaptureError::Unavailable(e.to_string()))?;

        let monitor = match &self.monitor {
            Some(name) => monitors.into_iter().find(|m| m.name() == name.as_str()),
            None => {
                let mut monitors = monitors;
                let primary = monitors.iter().position(|m| m.is_primary()).unwrap_or(0);
                if monitors.is_empty() {
                    None
                } else {
                    Some(monitors.swap_remove(primary))
                }
            }
        }
        .ok_or_else(|| {
            CaptureError::Unavailable(
                self.monitor
                    .clone()
                    .unwrap_or_else(|| "no monitors found".to_string()),
            )
        })?;

        // The first grab is where the platform enforces screen recording
        // permission
        monitor
            .capture_image()
            .map_err(|e| CaptureError::Denied(e.to_string()))?;

        tracing::info!(
            "Acquired monitor '{}' ({}x{})",
            monitor.name(),
            monitor.width(),
            monitor.height()
        );

        Ok(Box::new(MonitorSource {
            monitor,
            failures: 0,
            stopped: false,
        }))
    }
}

/// Source backed by one xcap monitor
pub struct MonitorSource {
    monitor: Monitor,
    failures: u32,
    stopped: bool,
}

impl ScreenSource for MonitorSource {
    fn grab(&mut self) -> Result<RgbaImage, CaptureError> {
        if self.stopped {
            return Err(CaptureError::SourceEnded);
        }

        match self.monitor.capture_image() {
            Ok(image) => {
                self.failures = 0;
                Ok(image)
            }
            Err(e) => {
                self.failures += 1;
                if self.failures >= MAX_CONSECUTIVE_FAILURES {
                    tracing::info!("Monitor '{}' stopped producing frames: {}", self.monitor.name(), e);
                    self.stopped = true;
                    Err(CaptureError::SourceEnded)
                } else {
                    Err(CaptureError::Backend(e.to_string()))
                }
            }
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
    }

    fn describe(&self) -> String {
        format!("monitor '{}'", self.monitor.name())
    }
}

/// Names of the monitors available for capture, primary first
pub fn list_monitors() -> Result<Vec<String>, CaptureError> {
    let mut monitors = Monitor::all().map_err(|e| CaptureError::Unavailable(e.to_string()))?;
    monitors.sort_by_key(|m| !m.is_primary());
    Ok(monitors
        .iter()
        .map(|m| format!("{} ({}x{})", m.name(), m.width(), m.height()))
        .collect())
}
