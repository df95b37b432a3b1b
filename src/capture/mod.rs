pub mod controls;
pub mod engine;
pub mod frame;
pub mod v4l2;

pub use engine::{CaptureEngine, FrameSkip};
pub use frame::FrameMeta;
pub use v4l2::V4l2Capture;

use crate::error::CaptureError;

/// A device that fills a ring of buffers with compressed frames.
///
/// The slice returned by [`next_frame`](FrameSource::next_frame) stays owned by
/// the caller only until the next call, which hands the buffer back to the
/// device before dequeuing again. A buffer is therefore out of the ring while
/// the caller stages and publishes it; the device keeps filling the others.
/// Callers copy what they keep, since the buffer is refilled once returned.
pub trait FrameSource: Send {
    /// Begin active capture.
    fn start(&mut self) -> Result<(), CaptureError>;

    /// Block until the device has a filled buffer and return its payload.
    fn next_frame(&mut self) -> Result<&[u8], CaptureError>;

    /// Stop active capture. Outstanding buffers are reclaimed by the device.
    fn stop(&mut self) -> Result<(), CaptureError>;
}
