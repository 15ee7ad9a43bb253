//! Raw TCP host/connect primitive.
//!
//! No parsing happens here: accepted sockets loop on recv and hand the raw
//! bytes to the caller through the [`TcpDelegate`] callbacks. The accept
//! structure mirrors the HTTP listener, including the connection ceiling and
//! the per-connection write queue; stopping a TCP server eagerly closes its
//! live connections instead of letting them drain.

use crate::http::writer::{is_disconnect, WriteQueue};
use crate::server::listener::{bind, stopped};

use anyhow::Context;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;

const DEFAULT_MAX_DATA_READ: usize = 8192;

/// Options accepted by [`host`].
#[derive(Debug, Clone)]
pub struct TcpOptions {
    pub address: String,
    /// Bind port; 0 asks the OS for an ephemeral port.
    pub port: u16,
    pub reuse_address: bool,
    /// Socket read size per recv.
    pub max_data_read: usize,
    /// Ceiling on concurrently served connections. Also bounds the listen
    /// backlog, which is clamped to 128.
    pub max_connections: usize,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 0,
            reuse_address: false,
            max_data_read: DEFAULT_MAX_DATA_READ,
            max_connections: 512,
        }
    }
}

impl TcpOptions {
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = enabled;
        self
    }

    pub fn with_max_data_read(mut self, size: usize) -> Self {
        self.max_data_read = size;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

/// Callbacks fired by TCP servers and clients.
///
/// `open` runs once the connection is established, `data` on every recv with
/// the received bytes, `closed` exactly once when the connection ends for
/// any reason. Callbacks receive the connection's [`TcpHandle`] and may send
/// or close from inside the callback.
pub trait TcpDelegate: Send + Sync + 'static {
    fn open(&self, _conn: &TcpHandle) {}
    fn data(&self, _conn: &TcpHandle, _data: Bytes) {}
    fn closed(&self, _conn: &TcpHandle) {}
}

/// Cloneable per-connection handle handed to delegate callbacks.
#[derive(Clone)]
pub struct TcpHandle {
    id: u64,
    peer: SocketAddr,
    queue: WriteQueue,
    closer: Arc<Notify>,
}

impl TcpHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Enqueues bytes on the connection's write queue.
    pub fn send(&self, data: impl Into<Bytes>) {
        self.queue.enqueue(data.into());
    }

    /// Asks the connection's driver to close.
    pub fn close(&self) {
        self.closer.notify_one();
    }
}

/// Handle to a hosting TCP server.
pub struct TcpServer {
    local_addr: SocketAddr,
    registry: Arc<Mutex<HashMap<u64, SocketAddr>>>,
    stopped: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TcpServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Stops accepting and eagerly closes every live connection. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::info!(addr = %self.local_addr, "tcp server stopping");
            let _ = self.shutdown.send(true);
        }
    }

    pub async fn join(self) -> anyhow::Result<()> {
        self.task.await.context("tcp accept loop panicked")
    }
}

/// Binds a raw TCP server and spawns its accept loop.
pub async fn host(options: TcpOptions, delegate: impl TcpDelegate) -> anyhow::Result<TcpServer> {
    let delegate: Arc<dyn TcpDelegate> = Arc::new(delegate);

    let backlog = options.max_connections.min(128) as u32;
    let listener = bind(&options.address, options.port, options.reuse_address, backlog)?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "tcp listening");

    let registry = Arc::new(Mutex::new(HashMap::new()));
    let semaphore = Arc::new(Semaphore::new(options.max_connections));
    let (shutdown, shutdown_rx) = watch::channel(false);

    let max_data_read = options.max_data_read;
    let accept_registry = Arc::clone(&registry);
    let task = tokio::spawn(async move {
        let mut next_id: u64 = 0;
        let mut shutdown_rx = shutdown_rx;

        loop {
            let permit = tokio::select! {
                _ = stopped(&mut shutdown_rx) => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                _ = stopped(&mut shutdown_rx) => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) if is_disconnect(&e) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "tcp accept failed, stopping");
                        break;
                    }
                },
            };

            next_id += 1;
            let id = next_id;
            accept_registry.lock().unwrap().insert(id, peer);
            tracing::debug!(peer = %peer, "tcp connection accepted");

            let (reader, handle) = make_handle(id, peer, stream);
            delegate.open(&handle);

            let delegate = Arc::clone(&delegate);
            let registry = Arc::clone(&accept_registry);
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                read_loop(reader, handle, delegate, shutdown_rx, max_data_read).await;
                registry.lock().unwrap().remove(&id);
                drop(permit);
            });
        }

        tracing::debug!("tcp accept loop stopped");
    });

    Ok(TcpServer {
        local_addr,
        registry,
        stopped: Arc::new(AtomicBool::new(false)),
        shutdown,
        task,
    })
}

/// Handle to an outbound TCP connection.
pub struct TcpClient {
    handle: TcpHandle,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TcpClient {
    pub fn peer_addr(&self) -> SocketAddr {
        self.handle.peer_addr()
    }

    pub fn send(&self, data: impl Into<Bytes>) {
        self.handle.send(data);
    }

    /// Closes the connection; the delegate's `closed` still fires.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Waits for the read loop to finish.
    pub async fn join(self) -> anyhow::Result<()> {
        self.task.await.context("tcp client loop panicked")
    }
}

/// Connects to `address:port` and spawns the client's read loop.
///
/// Name resolution may yield several candidates; each is tried in order.
/// `ConnectionRefused` moves on to the next candidate, any other error
/// aborts, and running out of candidates reports `ConnectionRefused`.
pub async fn connect(
    address: &str,
    port: u16,
    delegate: impl TcpDelegate,
) -> anyhow::Result<TcpClient> {
    let delegate: Arc<dyn TcpDelegate> = Arc::new(delegate);

    let candidates = lookup_host((address, port))
        .await
        .with_context(|| format!("cannot resolve {address}:{port}"))?;

    let mut stream = None;
    for candidate in candidates {
        match TcpStream::connect(candidate).await {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("connect to {candidate} failed"));
            }
        }
    }
    let Some(stream) = stream else {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("no candidate for {address}:{port} accepted the connection"),
        ))
        .context("connect failed");
    };

    let peer = stream.peer_addr()?;
    tracing::debug!(peer = %peer, "tcp connected");

    let (reader, handle) = make_handle(0, peer, stream);
    delegate.open(&handle);

    let (shutdown, shutdown_rx) = watch::channel(false);
    let loop_handle = handle.clone();
    let task = tokio::spawn(async move {
        read_loop(
            reader,
            loop_handle,
            delegate,
            shutdown_rx,
            DEFAULT_MAX_DATA_READ,
        )
        .await;
    });

    Ok(TcpClient {
        handle,
        shutdown,
        task,
    })
}

fn make_handle(id: u64, peer: SocketAddr, stream: TcpStream) -> (OwnedReadHalf, TcpHandle) {
    let (reader, write_half) = stream.into_split();
    let handle = TcpHandle {
        id,
        peer,
        queue: WriteQueue::new(write_half),
        closer: Arc::new(Notify::new()),
    };
    (reader, handle)
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    handle: TcpHandle,
    delegate: Arc<dyn TcpDelegate>,
    mut shutdown: watch::Receiver<bool>,
    max_data_read: usize,
) {
    let mut buf = vec![0u8; max_data_read];

    loop {
        tokio::select! {
            _ = handle.closer.notified() => break,
            _ = stopped(&mut shutdown) => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => delegate.data(&handle, Bytes::copy_from_slice(&buf[..n])),
                Err(e) if is_disconnect(&e) => break,
                Err(e) => {
                    tracing::warn!(peer = %handle.peer_addr(), error = %e, "tcp recv failed");
                    break;
                }
            },
        }
    }

    delegate.closed(&handle);
    handle.queue.drain().await;
    // Handles may outlive the loop; shut the socket down regardless
    handle.queue.close();
}
