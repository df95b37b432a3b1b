use std::io;

use thiserror::Error;

/// Configuration could not be loaded or failed validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Device-side failures. All of them are fatal to the process.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: io::Error },

    #[error("{0} is not a video capture device")]
    NotCapture(String),

    #[error("device rejected {what}: {source}")]
    Negotiate { what: &'static str, source: io::Error },

    #[error("device negotiated {actual} instead of MJPG")]
    UnsupportedFormat { actual: String },

    #[error("failed to map capture buffers: {0}")]
    Map(io::Error),

    #[error("streaming ioctl failed: {0}")]
    Stream(io::Error),

    #[error("capture stream not started")]
    NotStarted,

    #[error("no MJPEG capable capture device found")]
    NoDevice,
}

/// A captured frame violates the compressed-frame layout the repair step relies on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RepairError {
    #[error("no start-of-frame marker in {scanned} byte frame")]
    MissingStartOfFrame { scanned: usize },
}

/// Per-connection failures; they end one stream and nothing else.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("client socket not writable within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("poll failed: {0}")]
    Poll(#[from] nix::errno::Errno),

    #[error(transparent)]
    Io(#[from] io::Error),
}
