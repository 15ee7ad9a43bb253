use crate::http::connection::{Connection, ConnectionConfig, Handler};
use crate::http::parser::ParseLimits;
use crate::http::request::Request;
use crate::http::response::IntoResponse;
use crate::http::writer::is_disconnect;

use anyhow::Context;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

/// Keep-alive policy for served connections.
#[derive(Debug, Clone)]
pub struct KeepAlive {
    /// Close after the first response when false.
    pub enabled: bool,
    /// Deadline for requests after the first; zero means the client timeout
    /// applies throughout.
    pub timeout: Duration,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::ZERO,
        }
    }
}

/// Options accepted by [`serve`].
#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Bind port; 0 asks the OS for an ephemeral port.
    pub port: u16,
    /// Bind address.
    pub address: String,
    /// Set SO_REUSEADDR (and SO_REUSEPORT where present) before binding.
    pub reuse_address: bool,
    /// Reject bodies whose Content-Length exceeds this.
    pub max_body_size: usize,
    /// Ceiling on concurrently served connections; the accept loop parks at
    /// the ceiling until a connection ends.
    pub max_connections: usize,
    /// OS listen backlog.
    pub max_backlog: u32,
    /// Deadline for the first request on a connection.
    pub client_timeout: Duration,
    pub keep_alive: KeepAlive,
    /// Maximum request-target length.
    pub max_uri_size: usize,
    /// Maximum header count per request.
    pub max_headers: usize,
}

impl Default for ServeOptions {
    fn default() -> Self {
        let limits = ParseLimits::default();
        Self {
            port: 80,
            address: "127.0.0.1".to_string(),
            reuse_address: false,
            max_body_size: limits.max_body_size,
            max_connections: 1024,
            max_backlog: 512,
            client_timeout: Duration::from_secs(60),
            keep_alive: KeepAlive::default(),
            max_uri_size: limits.max_uri_size,
            max_headers: limits.max_headers,
        }
    }
}

impl ServeOptions {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = enabled;
        self
    }

    pub fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: KeepAlive) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_max_uri_size(mut self, size: usize) -> Self {
        self.max_uri_size = size;
        self
    }

    pub fn with_max_headers(mut self, max: usize) -> Self {
        self.max_headers = max;
        self
    }
}

/// Handle to a running HTTP server.
///
/// The accept loop runs as its own task. Dropping the handle or calling
/// [`stop`](Self::stop) closes the listening socket; connections already
/// accepted are left to drain until their drivers finish.
pub struct Server {
    local_addr: SocketAddr,
    registry: Arc<Mutex<HashMap<u64, SocketAddr>>>,
    stopped: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Server {
    /// The bound address, useful when serving on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connections currently registered.
    pub fn connection_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Stops accepting. Idempotent; in-flight connections drain on their own.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            tracing::info!(addr = %self.local_addr, "server stopping");
            let _ = self.shutdown.send(true);
        }
    }

    /// Waits for the accept loop to finish.
    pub async fn join(self) -> anyhow::Result<()> {
        self.task.await.context("accept loop panicked")
    }
}

/// Binds the listening socket and spawns the accept loop.
///
/// The `request` callback runs once per parsed request; whatever it returns
/// is serialized as the response. A panic inside the callback turns into a
/// `500 Internal Server Error` and ends that connection only.
pub async fn serve<F, R>(options: ServeOptions, request: F) -> anyhow::Result<Server>
where
    F: Fn(Request) -> R + Send + Sync + 'static,
    R: IntoResponse,
{
    let handler: Arc<Handler> = Arc::new(move |req| request(req).into_response());

    let config = Arc::new(ConnectionConfig {
        limits: ParseLimits {
            max_uri_size: options.max_uri_size,
            max_headers: options.max_headers,
            max_body_size: options.max_body_size,
        },
        client_timeout: options.client_timeout,
        keep_alive_enabled: options.keep_alive.enabled,
        keep_alive_timeout: options.keep_alive.timeout,
    });

    let listener = bind(
        &options.address,
        options.port,
        options.reuse_address,
        options.max_backlog,
    )?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "listening");

    let registry = Arc::new(Mutex::new(HashMap::new()));
    let semaphore = Arc::new(Semaphore::new(options.max_connections));
    let (shutdown, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(accept_loop(
        listener,
        config,
        handler,
        Arc::clone(&registry),
        semaphore,
        shutdown_rx,
    ));

    Ok(Server {
        local_addr,
        registry,
        stopped: Arc::new(AtomicBool::new(false)),
        shutdown,
        task,
    })
}

pub(crate) fn bind(
    address: &str,
    port: u16,
    reuse_address: bool,
    backlog: u32,
) -> anyhow::Result<TcpListener> {
    let ip: IpAddr = address
        .parse()
        .with_context(|| format!("invalid bind address: {address}"))?;
    let addr = SocketAddr::new(ip, port);

    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if reuse_address {
        socket.set_reuseaddr(true)?;
        #[cfg(unix)]
        socket.set_reuseport(true)?;
    }
    socket.bind(addr)?;

    Ok(socket.listen(backlog)?)
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<ConnectionConfig>,
    handler: Arc<Handler>,
    registry: Arc<Mutex<HashMap<u64, SocketAddr>>>,
    semaphore: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next_id: u64 = 0;

    loop {
        // Park here while the connection ceiling is reached; a driver
        // exiting returns its permit and wakes us.
        let permit = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let (stream, peer) = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) if is_disconnect(&e) => {
                    tracing::debug!("listener closed");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed, stopping");
                    break;
                }
            },
        };

        next_id += 1;
        let id = next_id;
        registry.lock().unwrap().insert(id, peer);
        tracing::debug!(peer = %peer, "accepted connection");

        let connection = Connection::new(stream, Arc::clone(&config), Arc::clone(&handler));
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Err(e) = connection.run().await {
                tracing::warn!(peer = %peer, error = %e, "connection error");
            }
            registry.lock().unwrap().remove(&id);
            drop(permit);
        });
    }

    tracing::debug!("accept loop stopped");
}

/// Resolves when the server is asked to stop, or when the handle is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    if *shutdown.borrow() {
        return;
    }
    let _ = shutdown.changed().await;
}
