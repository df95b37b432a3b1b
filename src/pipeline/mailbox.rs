//! Single-slot frame store shared by the capture thread and every client

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::capture::FrameMeta;

/// Holds the newest published frame and wakes every waiting reader on publish.
///
/// There is exactly one slot: a reader that falls behind skips straight to
/// whatever frame is current when it wakes. Payload, length and timestamp are
/// only touched under the one lock, so a reader never sees half of a publish.
pub struct FrameMailbox {
    slot: Mutex<Slot>,
    updated: Condvar,

    /// Statistics
    stats: CachePadded<Stats>,
}

struct Slot {
    data: Vec<u8>,
    meta: Option<FrameMeta>,
    sequence: u64,
    closed: bool,
}

#[derive(Default)]
struct Stats {
    frames_published: AtomicUsize,
    frames_delivered: AtomicUsize,
    readers_waiting: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStats {
    pub published: usize,
    pub delivered: usize,
    pub waiting: usize,
}

impl FrameMailbox {
    /// `capacity` is the largest frame expected; the slot is allocated once.
    pub fn new(capacity: usize) -> Self {
        Self {
            slot: Mutex::new(Slot {
                data: Vec::with_capacity(capacity),
                meta: None,
                sequence: 0,
                closed: false,
            }),
            updated: Condvar::new(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: replace the current frame and wake every waiting reader.
    ///
    /// Returns the sequence number assigned to the frame.
    pub fn publish(&self, bytes: &[u8], captured_at: SystemTime) -> u64 {
        let mut slot = self.slot.lock();
        slot.data.clear();
        slot.data.extend_from_slice(bytes);
        slot.sequence += 1;
        let sequence = slot.sequence;
        slot.meta = Some(FrameMeta {
            sequence,
            len: bytes.len(),
            captured_at,
        });
        self.updated.notify_all();
        drop(slot);

        self.stats.frames_published.fetch_add(1, Ordering::Relaxed);
        sequence
    }

    /// Consumer: block until a frame newer than `after` is published, then copy
    /// it into `out` while still holding the lock.
    ///
    /// Passing [`sequence()`](Self::sequence) waits for the next publish. Passing
    /// the sequence of the last frame received returns at once if the reader
    /// already fell behind. Returns `None` once the mailbox is closed.
    pub fn await_next(&self, after: u64, out: &mut Vec<u8>) -> Option<FrameMeta> {
        let mut slot = self.slot.lock();

        self.stats.readers_waiting.fetch_add(1, Ordering::Relaxed);
        while !slot.closed && slot.sequence <= after {
            self.updated.wait(&mut slot);
        }
        self.stats.readers_waiting.fetch_sub(1, Ordering::Relaxed);

        if slot.closed {
            return None;
        }

        out.clear();
        out.extend_from_slice(&slot.data);
        let meta = slot.meta;
        drop(slot);

        self.stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
        meta
    }

    /// Sequence number of the current frame, 0 before the first publish.
    pub fn sequence(&self) -> u64 {
        self.slot.lock().sequence
    }

    /// Wake every reader and make all further waits return `None`.
    pub fn close(&self) {
        let mut slot = self.slot.lock();
        slot.closed = true;
        self.updated.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }

    pub fn stats(&self) -> MailboxStats {
        MailboxStats {
            published: self.stats.frames_published.load(Ordering::Relaxed),
            delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            waiting: self.stats.readers_waiting.load(Ordering::Relaxed),
        }
    }
}
