//! Application configuration
//!
//! Loaded from `config.toml` in the platform config directory. Every field
//! has a default so a missing or partial file still yields a usable config.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionPreferences,
    pub network: NetworkConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub ui: UiConfig,
}

/// Preferences forwarded verbatim in the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPreferences {
    pub speaker1_voice_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker2_voice_id: Option<String>,
    /// Milliseconds between transmitted frames
    pub capture_interval: u64,
}

impl Default for SessionPreferences {
    fn default() -> Self {
        Self {
            speaker1_voice_id: DEFAULT_SPEAKER1_VOICE_ID.to_string(),
            speaker2_voice_id: None,
            capture_interval: DEFAULT_CAPTURE_INTERVAL_MS,
        }
    }
}

impl SessionPreferences {
    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval)
    }
}

/// Remote endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Base WebSocket URL, e.g. `ws://localhost:8000`
    pub endpoint: String,
    pub connect_timeout_ms: u64,
    /// How long to wait for the `ready` acknowledgement
    pub ready_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            connect_timeout_ms: 10_000,
            ready_timeout_ms: 15_000,
        }
    }
}

impl NetworkConfig {
    /// URL of the per-session duplex channel
    pub fn session_url(&self, session_id: u64) -> String {
        format!("{}/ws/{}", self.endpoint.trim_end_matches('/'), session_id)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

/// Screen sampling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Monitor name; primary monitor when absent
    pub monitor: Option<String>,
    /// Render loop rate for the live preview
    pub render_fps: u32,
    pub jpeg_quality: u8,
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            monitor: None,
            render_fps: DEFAULT_RENDER_FPS,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            max_width: 1920,
            max_height: 1080,
        }
    }
}

impl CaptureConfig {
    pub fn render_period(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.render_fps.max(1) as u64)
    }
}

/// Audio playback settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Maximum number of decoded fragments waiting to play
    pub queue_depth: usize,
    /// Output device id; default output device when absent
    pub device_id: Option<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            device_id: None,
        }
    }
}

/// Local preview server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1".to_string(),
            http_port: DEFAULT_UI_PORT,
        }
    }
}

/// Check a capture interval against the product bounds
pub fn validate_capture_interval(interval_ms: u64) -> Result<()> {
    if !(MIN_CAPTURE_INTERVAL_MS..=MAX_CAPTURE_INTERVAL_MS).contains(&interval_ms) {
        return Err(Error::Config(format!(
            "capture_interval must be between {} and {} ms, got {}",
            MIN_CAPTURE_INTERVAL_MS, MAX_CAPTURE_INTERVAL_MS, interval_ms
        )));
    }
    Ok(())
}

impl AppConfig {
    /// Default location of the config file
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "screen-commentary")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from the default location, falling back to defaults
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load and validate a config file
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::default_path()
            .ok_or_else(|| Error::Config("No config directory available".to_string()))?;
        self.save_to(&path)
    }

    pub fn validate(&self) -> Result<()> {
        validate_capture_interval(self.session.capture_interval)?;

        if self.playback.queue_depth == 0 {
            return Err(Error::Config("queue_depth must be at least 1".to_string()));
        }
        if self.capture.render_fps == 0 {
            return Err(Error::Config("render_fps must be at least 1".to_string()));
        }
        if !(1..=100).contains(&self.capture.jpeg_quality) {
            return Err(Error::Config(format!(
                "jpeg_quality must be between 1 and 100, got {}",
                self.capture.jpeg_quality
            )));
        }
        if self.capture.max_width == 0 || self.capture.max_height == 0 {
            return Err(Error::Config("max snapshot dimensions must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.playback.queue_depth, 2);
        assert_eq!(config.capture.jpeg_quality, 80);
    }

    #[test]
    fn test_capture_interval_bounds() {
        assert!(validate_capture_interval(5_000).is_ok());
        assert!(validate_capture_interval(30_000).is_ok());
        assert!(validate_capture_interval(4_999).is_err());
        assert!(validate_capture_interval(30_001).is_err());
    }

    #[test]
    fn test_session_url() {
        let mut network = NetworkConfig::default();
        network.endpoint = "ws://example.test:9000/".to_string();
        assert_eq!(network.session_url(42), "ws://example.test:9000/ws/42");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [session]
            speaker1_voice_id = "abc"
            capture_interval = 10000

            [playback]
            queue_depth = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.session.speaker1_voice_id, "abc");
        assert_eq!(config.session.speaker2_voice_id, None);
        assert_eq!(config.playback.queue_depth, 3);
        assert_eq!(config.network.endpoint, DEFAULT_ENDPOINT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join(format!("screen-commentary-{}", std::process::id()));
        let path = dir.join("config.toml");

        let mut config = AppConfig::default();
        config.session.speaker2_voice_id = Some("second".to_string());
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.session, config.session);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
