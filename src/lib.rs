pub mod capture;
pub mod error;
pub mod pipeline;
pub mod stream;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub use capture::{CaptureEngine, FrameSource, V4l2Capture};
pub use error::{CaptureError, ConfigError, DispatchError, RepairError};
pub use pipeline::FrameMailbox;
pub use stream::StreamServer;

/// Effective configuration, published once the device has been negotiated
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Environment variable prefix, e.g. `UVC_STREAM_SERVER__PORT=9000`.
pub const ENV_PREFIX: &str = "UVC_STREAM";

/// System configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub server: ServerConfig,
    pub controls: ControlsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device node; empty means auto-detect
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Published frames per second
    pub fps: u32,
    /// Rate the sensor is driven at. Higher than `fps` reduces tearing.
    pub device_fps: u32,
    pub buffer_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub handshake_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    /// Detach from the terminal before starting
    pub background: bool,
}

/// Camera controls applied once after the device is opened.
///
/// `exposure` and `focus` accept `-1` to hand the setting back to the camera's
/// automatic mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub brightness: Option<i64>,
    pub contrast: Option<i64>,
    pub saturation: Option<i64>,
    pub sharpness: Option<i64>,
    pub exposure: Option<i64>,
    pub focus: Option<i64>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            width: 640,
            height: 480,
            fps: 5,
            device_fps: 30,
            buffer_count: 4,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: 8080,
            handshake_timeout_ms: 5000,
            shutdown_grace_ms: 2000,
            background: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            server: ServerConfig::default(),
            controls: ControlsConfig::default(),
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `UVC_STREAM_*` environment
    /// variables, in increasing precedence.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.capture;
        for (name, value) in [
            ("capture.width", c.width),
            ("capture.height", c.height),
            ("capture.fps", c.fps),
            ("capture.device_fps", c.device_fps),
            ("capture.buffer_count", c.buffer_count),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        if c.fps > c.device_fps {
            return Err(ConfigError::Invalid(format!(
                "capture.fps ({}) exceeds capture.device_fps ({})",
                c.fps, c.device_fps
            )));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

impl CaptureConfig {
    /// Upper bound for one compressed frame at this resolution.
    pub fn max_frame_len(&self) -> usize {
        (self.width as usize * self.height as usize) << 1
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
