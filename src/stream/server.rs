//! Stream server listener
//!
//! Accepts TCP connections and hands each one to a [`Dispatcher`] on the
//! runtime's blocking pool.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::pipeline::FrameMailbox;
use crate::stream::Dispatcher;
use crate::ServerConfig;

const LISTEN_BACKLOG: u32 = 10;

/// Live client sockets, kept so shutdown can unblock their writers
#[derive(Clone, Default)]
pub struct Connections {
    inner: Arc<Mutex<HashMap<u64, std::net::TcpStream>>>,
}

impl Connections {
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    fn insert(&self, id: u64, stream: std::net::TcpStream) {
        self.inner.lock().insert(id, stream);
        metrics::gauge!("connections_active").increment(1.0);
    }

    fn remove(&self, id: u64) {
        if self.inner.lock().remove(&id).is_some() {
            metrics::gauge!("connections_active").decrement(1.0);
        }
    }

    /// Shut down every socket; blocked writes fail and their dispatchers exit
    fn close_all(&self) -> usize {
        let connections = self.inner.lock();
        for stream in connections.values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        connections.len()
    }
}

/// MJPEG stream server
pub struct StreamServer {
    listener: TcpListener,
    config: ServerConfig,
    mailbox: Arc<FrameMailbox>,
    stop: Arc<AtomicBool>,
    next_id: AtomicU64,
    connections: Connections,
    dispatchers: Mutex<JoinSet<()>>,
}

impl StreamServer {
    /// Bind the listening socket with `SO_REUSEADDR`
    pub async fn bind(
        config: ServerConfig,
        mailbox: Arc<FrameMailbox>,
        stop: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let ip: IpAddr = config.bind_address.parse().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("bind address {:?}: {}", config.bind_address, e),
            )
        })?;
        let addr = SocketAddr::new(ip, config.port);

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;

        Ok(Self {
            listener,
            config,
            mailbox,
            stop,
            next_id: AtomicU64::new(1),
            connections: Connections::default(),
            dispatchers: Mutex::new(JoinSet::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for observing live connections
    pub fn connections(&self) -> Connections {
        self.connections.clone()
    }

    /// Accept connections until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = self.local_addr() {
            info!(%addr, "Streaming on http://localhost:{}/", addr.port());
        }

        tokio::select! {
            _ = shutdown => info!("Shutdown signal received"),
            _ = self.accept_loop() => {}
        }
    }

    async fn accept_loop(&self) {
        loop {
            match self.listener.accept().await {
                Ok((socket, peer)) => self.handle_connection(socket, peer),
                Err(e) => {
                    // typically EMFILE; back off instead of spinning
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("connections_accepted").increment(1);
        debug!(conn = id, %peer, "New connection");

        // dispatchers block, so they get plain blocking sockets
        let stream = match socket.into_std().and_then(|s| {
            s.set_nonblocking(false)?;
            Ok(s)
        }) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(conn = id, error = %e, "Failed to configure socket");
                return;
            }
        };
        match stream.try_clone() {
            Ok(handle) => self.connections.insert(id, handle),
            Err(e) => {
                warn!(conn = id, error = %e, "Failed to register connection");
                return;
            }
        }

        let dispatcher = Dispatcher::new(
            id,
            peer,
            stream,
            Arc::clone(&self.mailbox),
            Arc::clone(&self.stop),
            self.config.handshake_timeout(),
        );
        let connections = self.connections.clone();

        let mut dispatchers = self.dispatchers.lock();
        while dispatchers.try_join_next().is_some() {}
        dispatchers.spawn_blocking(move || {
            match dispatcher.run() {
                Ok(sent) => debug!(conn = id, sent, "Connection closed"),
                Err(e) => debug!(conn = id, error = %e, "Connection error"),
            }
            connections.remove(id);
        });
    }

    /// Close the listener and every client, then wait up to the configured
    /// grace period for dispatchers to exit.
    ///
    /// The mailbox should be closed first so idle dispatchers wake up. Returns
    /// the number of dispatchers still running when the grace period ended.
    pub async fn shutdown(self) -> usize {
        let Self {
            listener,
            config,
            connections,
            dispatchers,
            ..
        } = self;
        drop(listener);

        let open = connections.close_all();
        info!(open, "Closing client connections");

        let mut dispatchers = dispatchers.into_inner();
        let drained = tokio::time::timeout(config.shutdown_grace(), async {
            while dispatchers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                lingering = dispatchers.len(),
                "Dispatchers still running after grace period"
            );
        }
        dispatchers.len()
    }
}
