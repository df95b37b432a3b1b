//! Per-connection worker: handshake, then one multipart part per new frame

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, error, instrument};

use crate::error::DispatchError;
use crate::pipeline::FrameMailbox;
use crate::stream::multipart::{self, RESPONSE_HEADER};
use crate::stream::RepairedFrame;

/// Streams the mailbox to one client until a write fails or the server stops.
///
/// Runs on a blocking thread: it parks in [`FrameMailbox::await_next`] between
/// frames and socket writes block only this connection.
pub struct Dispatcher {
    id: u64,
    peer: SocketAddr,
    stream: TcpStream,
    mailbox: Arc<FrameMailbox>,
    stop: Arc<AtomicBool>,
    handshake_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        id: u64,
        peer: SocketAddr,
        stream: TcpStream,
        mailbox: Arc<FrameMailbox>,
        stop: Arc<AtomicBool>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            id,
            peer,
            stream,
            mailbox,
            stop,
            handshake_timeout,
        }
    }

    /// Returns the number of parts sent before the stream ended cleanly.
    #[instrument(name = "dispatch", skip(self), fields(conn = self.id, peer = %self.peer))]
    pub fn run(mut self) -> Result<u64, DispatchError> {
        wait_writable(&self.stream, self.handshake_timeout)?;
        self.stream.write_all(RESPONSE_HEADER.as_bytes())?;
        debug!("Handshake sent");

        let mut frame = Vec::new();
        let mut part = BytesMut::new();
        let mut sent = 0;
        // only frames published after the handshake
        let mut cursor = self.mailbox.sequence();

        while !self.stop.load(Ordering::Acquire) {
            let Some(meta) = self.mailbox.await_next(cursor, &mut frame) else {
                break;
            };
            cursor = meta.sequence;

            // a cleanly closed peer still accepts one write into the kernel buffer
            if peer_hung_up(&self.stream) {
                debug!("Client hung up");
                break;
            }

            let repaired = match RepairedFrame::new(&frame) {
                Ok(repaired) => repaired,
                Err(e) => {
                    error!(sequence = meta.sequence, "Corrupt frame not sent: {}", e);
                    continue;
                }
            };

            part.clear();
            multipart::encode_part(&mut part, meta.epoch_millis(), &repaired);
            self.stream.write_all(&part)?;

            sent += 1;
            metrics::counter!("frames_sent").increment(1);
        }

        debug!(sent, "Stream ended");
        Ok(sent)
    }
}

/// Block until `stream` accepts writes, giving up after `timeout`.
fn wait_writable(stream: &TcpStream, timeout: Duration) -> Result<(), DispatchError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLOUT)];
        let poll_timeout = PollTimeout::try_from(remaining).unwrap_or(PollTimeout::MAX);

        match poll(&mut fds, poll_timeout) {
            Ok(0) => return Err(DispatchError::HandshakeTimeout(timeout)),
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// `true` once the client has closed its end or the connection was reset.
fn peer_hung_up(stream: &TcpStream) -> bool {
    let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLRDHUP)];
    match poll(&mut fds, PollTimeout::ZERO) {
        Ok(0) | Err(_) => false,
        Ok(_) => fds[0].revents().is_some_and(|events| {
            events.intersects(PollFlags::POLLRDHUP | PollFlags::POLLHUP | PollFlags::POLLERR)
        }),
    }
}
