//! Capture loop: pulls buffers from the device, throttles, publishes

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{info, trace, warn};

use crate::capture::FrameSource;
use crate::error::CaptureError;
use crate::pipeline::FrameMailbox;
use crate::CaptureConfig;

/// Fixed-ratio throttle: accepts one frame out of every `device_fps / target_fps`.
#[derive(Debug, Clone)]
pub struct FrameSkip {
    ratio: u32,
    count: u32,
}

impl FrameSkip {
    pub fn new(device_fps: u32, target_fps: u32) -> Self {
        Self {
            ratio: (device_fps / target_fps.max(1)).max(1),
            count: 0,
        }
    }

    pub fn ratio(&self) -> u32 {
        self.ratio
    }

    /// Count one captured frame; `true` when it is due for publication.
    pub fn tick(&mut self) -> bool {
        self.count += 1;
        if self.count >= self.ratio {
            self.count = 0;
            true
        } else {
            false
        }
    }
}

/// Owns the capture device and feeds the mailbox
pub struct CaptureEngine<S: FrameSource> {
    source: S,
    mailbox: Arc<FrameMailbox>,
    skip: FrameSkip,
    staging: Vec<u8>,
    stop: Arc<AtomicBool>,
}

impl<S: FrameSource> CaptureEngine<S> {
    pub fn new(
        source: S,
        config: &CaptureConfig,
        mailbox: Arc<FrameMailbox>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            source,
            mailbox,
            skip: FrameSkip::new(config.device_fps, config.fps),
            staging: vec![0; config.max_frame_len()],
            stop,
        }
    }

    /// Capture until the stop flag is raised. Any device error ends the loop
    /// and is returned to the caller as fatal.
    pub fn run(mut self) -> Result<(), CaptureError> {
        self.source.start()?;
        info!(
            ratio = self.skip.ratio(),
            staging = self.staging.len(),
            "Capture started"
        );

        while !self.stop.load(Ordering::Acquire) {
            self.step()?;
        }

        self.source.stop()?;
        info!("Capture stopped");
        Ok(())
    }

    /// One loop iteration: dequeue, throttle, stage, publish.
    ///
    /// Returns the sequence number when a frame was published.
    pub fn step(&mut self) -> Result<Option<u64>, CaptureError> {
        let frame = self.source.next_frame()?;
        let captured_at = SystemTime::now();
        metrics::counter!("frames_captured").increment(1);

        if !self.skip.tick() {
            return Ok(None);
        }

        let len = frame.len();
        if len > self.staging.len() {
            warn!(
                bytes = len,
                limit = self.staging.len(),
                "Frame larger than staging buffer, dropped"
            );
            metrics::counter!("frames_dropped_oversize").increment(1);
            return Ok(None);
        }
        self.staging[..len].copy_from_slice(frame);

        let sequence = self.mailbox.publish(&self.staging[..len], captured_at);
        trace!(sequence, bytes = len, "Frame published");
        metrics::counter!("frames_published").increment(1);
        metrics::histogram!("frame_bytes").record(len as f64);
        Ok(Some(sequence))
    }
}
