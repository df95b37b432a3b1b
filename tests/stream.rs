//! End-to-end streaming tests
//!
//! A synthetic camera feeds the real capture engine, mailbox and server on a
//! localhost port; clients speak plain TCP and parse the multipart stream.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use uvc_stream::stream::jpeg::{HUFFMAN_TABLE, START_OF_FRAME};
use uvc_stream::stream::Connections;
use uvc_stream::{
    CaptureConfig, CaptureEngine, CaptureError, FrameMailbox, FrameSource, ServerConfig,
    StreamServer,
};

const BOUNDARY_LINE: &[u8] = b"\n--uvc_stream\n";

// ── Synthetic camera ─────────────────────────────────────────────

/// Emits `SOI, SOF0, counter, filler, EOI` frames at a fixed device rate.
struct SyntheticCamera {
    interval: Duration,
    frame: Vec<u8>,
    captured: u64,
}

impl SyntheticCamera {
    fn new(interval: Duration, len: usize) -> Self {
        let mut frame = vec![0xFF, 0xD8];
        frame.extend_from_slice(&START_OF_FRAME);
        frame.extend_from_slice(&0u64.to_be_bytes());
        frame.resize(len - 2, 0x55);
        frame.extend_from_slice(&[0xFF, 0xD9]);
        Self {
            interval,
            frame,
            captured: 0,
        }
    }
}

impl FrameSource for SyntheticCamera {
    fn start(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    fn next_frame(&mut self) -> Result<&[u8], CaptureError> {
        thread::sleep(self.interval);
        self.captured += 1;
        self.frame[4..12].copy_from_slice(&self.captured.to_be_bytes());
        Ok(&self.frame)
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }
}

// ── Harness ──────────────────────────────────────────────────────

struct Harness {
    addr: SocketAddr,
    mailbox: Arc<FrameMailbox>,
    stop: Arc<AtomicBool>,
    connections: Connections,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<usize>,
    capture: thread::JoinHandle<Result<(), CaptureError>>,
}

/// 640x480, device at 30 fps, published at 5 fps. The synthetic device runs
/// 10 ms per frame so a publish lands every 60 ms.
async fn start(frame_len: usize) -> Harness {
    let capture_config = CaptureConfig {
        width: 640,
        height: 480,
        fps: 5,
        device_fps: 30,
        ..CaptureConfig::default()
    };
    let server_config = ServerConfig {
        bind_address: "127.0.0.1".into(),
        port: 0,
        ..ServerConfig::default()
    };

    let mailbox = Arc::new(FrameMailbox::new(capture_config.max_frame_len()));
    let stop = Arc::new(AtomicBool::new(false));

    let server = StreamServer::bind(server_config, mailbox.clone(), stop.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let connections = server.connections();

    let (shutdown, signal) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        server
            .run_until(async {
                let _ = signal.await;
            })
            .await;
        server.shutdown().await
    });

    let camera = SyntheticCamera::new(Duration::from_millis(10), frame_len);
    let engine = CaptureEngine::new(camera, &capture_config, mailbox.clone(), stop.clone());
    let capture = thread::spawn(move || engine.run());

    Harness {
        addr,
        mailbox,
        stop,
        connections,
        shutdown,
        server,
        capture,
    }
}

impl Harness {
    /// Run the shutdown sequence; returns lingering dispatchers.
    async fn stop(self) -> usize {
        self.stop.store(true, Ordering::Release);
        self.mailbox.close();
        let _ = self.shutdown.send(());

        let lingering = timeout(Duration::from_secs(5), self.server)
            .await
            .expect("server shutdown timed out")
            .unwrap();

        let capture = self.capture;
        let captured = timeout(
            Duration::from_secs(5),
            tokio::task::spawn_blocking(move || capture.join()),
        )
        .await
        .expect("capture did not stop")
        .unwrap()
        .unwrap();
        captured.unwrap();

        lingering
    }

    async fn wait_for_connections(&self, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.connections.len() != n {
            assert!(
                Instant::now() < deadline,
                "expected {} connections, have {}",
                n,
                self.connections.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

// ── Client ───────────────────────────────────────────────────────

struct Part {
    start_time: u64,
    counter: u64,
    frame: Vec<u8>,
}

struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    async fn read_until(&mut self, needle: &[u8]) -> Vec<u8> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = find(&self.buf[scanned..], needle) {
                return self.buf.drain(..scanned + pos + needle.len()).collect();
            }
            scanned = self.buf.len().saturating_sub(needle.len() - 1);
            let n = self.stream.read_buf(&mut self.buf).await.unwrap();
            assert!(n > 0, "stream closed early");
        }
    }

    async fn header(&mut self) -> String {
        let raw = timeout(Duration::from_secs(5), self.read_until(b"\r\n\r\n--uvc_stream\n"))
            .await
            .expect("no response header within 5s");
        String::from_utf8(raw).unwrap()
    }

    async fn next_part(&mut self) -> Part {
        let head = self.read_until(b"\n\n").await;
        let head = String::from_utf8(head).unwrap();
        let mut lines = head.lines();
        assert_eq!(lines.next(), Some("Content-type: image/jpeg"));
        let start_time = lines
            .next()
            .and_then(|l| l.strip_prefix("X-StartTime: "))
            .expect("missing X-StartTime")
            .parse()
            .unwrap();

        let mut frame = self.read_until(BOUNDARY_LINE).await;
        frame.truncate(frame.len() - BOUNDARY_LINE.len());

        // marker sits right after SOI, so the table lands at offset 2
        assert_eq!(&frame[..2], &[0xFF, 0xD8]);
        assert_eq!(&frame[2..422], &HUFFMAN_TABLE[..]);
        assert_eq!(&frame[422..424], &START_OF_FRAME);
        let counter = u64::from_be_bytes(frame[424..432].try_into().unwrap());

        Part {
            start_time,
            counter,
            frame,
        }
    }

    /// Drain until the server closes the connection
    async fn closed(&mut self) {
        let mut scratch = [0u8; 64 * 1024];
        loop {
            match self.stream.read(&mut scratch).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }
}

// ── Scenarios ────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_receives_header_then_parts() {
    let harness = start(4096).await;
    let mut client = Client::connect(harness.addr).await;

    let header = client.header().await;
    assert!(header.starts_with("HTTP/1.0 200 OK\r\n"));
    assert!(header.contains("Content-Type: multipart/x-mixed-replace;boundary=uvc_stream"));

    let first = timeout(Duration::from_secs(1), client.next_part())
        .await
        .expect("no part within 1s");
    assert_eq!(first.frame.len(), 4096 + HUFFMAN_TABLE.len());
    assert!(first.start_time > 0);

    let second = timeout(Duration::from_secs(1), client.next_part())
        .await
        .unwrap();
    assert!(second.counter > first.counter);
    assert!(second.start_time >= first.start_time);
    // 30 -> 5 fps: only every sixth captured frame goes out
    assert_eq!(first.counter % 6, 0);
    assert_eq!(second.counter % 6, 0);

    drop(client);
    assert_eq!(harness.stop().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_client_does_not_hold_back_others() {
    // 30 parts of 600 KB overflow any loopback socket buffer
    let harness = start(600_000).await;

    // connects and asks, then never reads
    let stalled = Client::connect(harness.addr).await;
    let mut healthy = Client::connect(harness.addr).await;
    healthy.header().await;
    harness.wait_for_connections(2).await;

    let published_before = harness.mailbox.stats().published;
    let mut last = healthy.next_part().await;
    for _ in 0..30 {
        let part = timeout(Duration::from_secs(1), healthy.next_part())
            .await
            .expect("healthy client starved");
        assert!(part.counter > last.counter);
        assert!(part.start_time >= last.start_time);
        last = part;
    }
    assert!(harness.mailbox.stats().published >= published_before + 30);

    // the stalled dispatcher is parked in a write, not waiting for frames
    assert_eq!(harness.connections.len(), 2);
    assert!(harness.mailbox.stats().waiting <= 1);

    let lingering = harness.stop().await;
    assert_eq!(lingering, 0);
    drop(stalled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_client_releases_its_dispatcher() {
    let harness = start(16 * 1024).await;

    let mut leaving = Client::connect(harness.addr).await;
    let mut staying = Client::connect(harness.addr).await;
    leaving.header().await;
    staying.header().await;
    harness.wait_for_connections(2).await;

    leaving.next_part().await;
    drop(leaving);
    let published_at_close = harness.mailbox.stats().published;

    harness.wait_for_connections(1).await;
    assert!(
        harness.mailbox.stats().published <= published_at_close + 1,
        "dispatcher outlived the first publish after its client left"
    );

    let mut last = staying.next_part().await;
    for _ in 0..3 {
        let part = timeout(Duration::from_secs(1), staying.next_part())
            .await
            .unwrap();
        assert!(part.counter > last.counter);
        last = part;
    }

    assert_eq!(harness.stop().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_closes_every_client_and_stops_capture() {
    let harness = start(4096).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut client = Client::connect(harness.addr).await;
        client.header().await;
        clients.push(client);
    }
    harness.wait_for_connections(3).await;
    for client in &mut clients {
        client.next_part().await;
    }

    let started = Instant::now();
    let connections = harness.connections.clone();
    assert_eq!(harness.stop().await, 0);
    assert!(connections.is_empty());

    for client in &mut clients {
        timeout(Duration::from_secs(2), client.closed())
            .await
            .expect("client left open after shutdown");
    }
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_clients_see_non_decreasing_timestamps() {
    let harness = start(2048).await;

    let mut readers = Vec::new();
    for _ in 0..4 {
        let addr = harness.addr;
        readers.push(tokio::spawn(async move {
            let mut client = Client::connect(addr).await;
            client.header().await;
            let mut seen = Vec::new();
            for _ in 0..8 {
                let part = timeout(Duration::from_secs(2), client.next_part())
                    .await
                    .unwrap();
                seen.push((part.start_time, part.counter));
            }
            seen
        }));
    }

    for reader in readers {
        let seen = reader.await.unwrap();
        for pair in seen.windows(2) {
            assert!(pair[1].0 >= pair[0].0);
            assert!(pair[1].1 > pair[0].1);
        }
    }

    assert_eq!(harness.stop().await, 0);
}
