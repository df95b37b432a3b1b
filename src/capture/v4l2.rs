//! V4L2 MJPEG capture over a ring of memory-mapped buffers

use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::{CaptureStream, Stream as _};
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::{controls, FrameSource};
use crate::error::CaptureError;
use crate::{CaptureConfig, ControlsConfig};

pub const MJPEG: &[u8; 4] = b"MJPG";

/// V4L2 capture device negotiated for MJPEG
pub struct V4l2Capture {
    device: Device,
    stream: Option<MmapStream<'static>>,
    config: CaptureConfig,
}

impl V4l2Capture {
    /// Open the device and negotiate format, resolution and capture rate
    pub fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
        info!("Initializing V4L2 capture: {}", config.device);

        let device = Device::with_path(&config.device).map_err(|source| CaptureError::Open {
            path: config.device.clone(),
            source,
        })?;

        // Query capabilities
        let caps = device.query_caps().map_err(|source| CaptureError::Negotiate {
            what: "capability query",
            source,
        })?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::NotCapture(config.device.clone()));
        }

        // Set format
        let mut fmt = device.format().map_err(|source| CaptureError::Negotiate {
            what: "format query",
            source,
        })?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = FourCC::new(MJPEG);

        let fmt = device
            .set_format(&fmt)
            .map_err(|source| CaptureError::Negotiate {
                what: "format",
                source,
            })?;
        if fmt.fourcc != FourCC::new(MJPEG) {
            return Err(CaptureError::UnsupportedFormat {
                actual: fmt.fourcc.to_string(),
            });
        }
        if (fmt.width, fmt.height) != (config.width, config.height) {
            warn!(
                "Driver adjusted resolution to {}x{} (requested {}x{})",
                fmt.width, fmt.height, config.width, config.height
            );
        }

        // The sensor always runs at device_fps; the engine throttles to fps
        device
            .set_params(&Parameters::with_fps(config.device_fps))
            .map_err(|source| CaptureError::Negotiate {
                what: "frame rate",
                source,
            })?;

        let mut config = config.clone();
        config.width = fmt.width;
        config.height = fmt.height;

        Ok(Self {
            device,
            stream: None,
            config,
        })
    }

    /// Configuration as negotiated with the driver
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn apply_controls(&self, controls: &ControlsConfig) -> usize {
        controls::apply(&self.device, controls)
    }
}

impl FrameSource for V4l2Capture {
    /// Request and map the buffer ring; streaming begins on the first dequeue
    fn start(&mut self) -> Result<(), CaptureError> {
        let stream =
            MmapStream::with_buffers(&self.device, Type::VideoCapture, self.config.buffer_count)
                .map_err(CaptureError::Map)?;

        self.stream = Some(stream);
        info!(
            "Capture stream started with {} buffers",
            self.config.buffer_count
        );
        Ok(())
    }

    #[instrument(level = "trace", skip(self))]
    fn next_frame(&mut self) -> Result<&[u8], CaptureError> {
        let stream = self.stream.as_mut().ok_or(CaptureError::NotStarted)?;

        // Requeues the previously returned buffer, then blocks on DQBUF
        let (buf, meta) = CaptureStream::next(stream).map_err(CaptureError::Stream)?;
        let used = (meta.bytesused as usize).min(buf.len());
        Ok(&buf[..used])
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        if let Some(mut stream) = self.stream.take() {
            stream.stop().map_err(CaptureError::Stream)?;
        }
        Ok(())
    }
}
