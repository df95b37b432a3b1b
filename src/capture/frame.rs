use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Describes the frame currently held by the mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    /// Publish counter, starts at 1 for the first frame
    pub sequence: u64,

    /// Payload length in bytes
    pub len: usize,

    /// Wall-clock time the buffer was dequeued
    pub captured_at: SystemTime,
}

impl FrameMeta {
    /// Capture time as milliseconds since the Unix epoch, as sent in `X-StartTime`.
    pub fn epoch_millis(&self) -> u64 {
        epoch_millis(self.captured_at)
    }
}

pub fn epoch_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
