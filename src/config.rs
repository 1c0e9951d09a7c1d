//! Application configuration
//!
//! Loaded from `config.toml` in the platform config directory. Every
//! section has defaults, so a missing file (or a missing section) is fine.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::network::transport::validate_endpoint;
use crate::protocol::CodecKind;

/// Environment variable that overrides the streaming endpoint
pub const ENDPOINT_ENV: &str = "VISION_STREAM_ENDPOINT";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub capture: CaptureConfig,
    pub encoder: EncoderConfig,
    pub render: RenderConfig,
    pub ui: UiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// `ws://` or `wss://` URL of the processing server
    pub endpoint: String,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub startup_timeout_ms: u64,
    pub send_queue_depth: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
            send_queue_depth: DEFAULT_SEND_QUEUE_DEPTH,
        }
    }
}

impl NetworkConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

/// Where frames come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSourceKind {
    /// Synthetic moving gradient
    TestPattern,
    /// Loop over the images in a directory
    ImageDir(PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: CaptureSourceKind,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub frame_buffer_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: CaptureSourceKind::TestPattern,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
            frame_buffer_capacity: FRAME_BUFFER_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub slice_interval_ms: u64,
    pub preferred_codec: CodecKind,
    pub fallback_codec: Option<CodecKind>,
    /// JPEG quality, 1-100
    pub jpeg_quality: u8,
    pub max_consecutive_errors: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            slice_interval_ms: DEFAULT_SLICE_INTERVAL_MS,
            preferred_codec: CodecKind::Mjpeg,
            fallback_codec: Some(CodecKind::Raw),
            jpeg_quality: 70,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ENCODE_ERRORS,
        }
    }
}

impl EncoderConfig {
    pub fn slice_interval(&self) -> Duration {
        Duration::from_millis(self.slice_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub refresh_hz: u32,
    pub reference_width: f64,
    pub reference_height: f64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            refresh_hz: DEFAULT_REFRESH_HZ,
            reference_width: REFERENCE_WIDTH,
            reference_height: REFERENCE_HEIGHT,
        }
    }
}

impl RenderConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.refresh_hz.max(1) as f64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub enabled: bool,
    pub bind_address: IpAddr,
    pub http_port: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: IpAddr::from([127, 0, 0, 1]),
            http_port: DEFAULT_UI_PORT,
        }
    }
}

impl AppConfig {
    /// Default location of the config file
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "vision-stream").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from the default location, falling back to defaults if absent.
    /// The endpoint environment override is applied afterwards.
    pub fn load() -> Result<Self> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path)?,
            _ => Self::default(),
        };
        if let Ok(endpoint) = std::env::var(ENDPOINT_ENV) {
            config.network.endpoint = endpoint;
        }
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        validate_endpoint(&self.network.endpoint).map_err(|e| Error::Config(e.to_string()))?;
        if !(50..=5000).contains(&self.encoder.slice_interval_ms) {
            return Err(Error::Config(format!(
                "slice_interval_ms must be within 50..=5000, got {}",
                self.encoder.slice_interval_ms
            )));
        }
        if !(1..=100).contains(&self.encoder.jpeg_quality) {
            return Err(Error::Config("jpeg_quality must be within 1..=100".into()));
        }
        if self.encoder.max_consecutive_errors == 0 {
            return Err(Error::Config("max_consecutive_errors must be at least 1".into()));
        }
        if self.capture.width == 0 || self.capture.height == 0 || self.capture.fps == 0 {
            return Err(Error::Config("capture width, height and fps must be non-zero".into()));
        }
        if self.capture.frame_buffer_capacity == 0 || self.network.send_queue_depth == 0 {
            return Err(Error::Config("buffer capacities must be non-zero".into()));
        }
        if self.render.reference_width <= 0.0 || self.render.reference_height <= 0.0 {
            return Err(Error::Config("reference space must be positive".into()));
        }
        Ok(())
    }
}
