//! NBD server implementation
//!
//! Accepts TCP or Unix socket connections and hands each to an
//! [`NbdConnection`](super::connection::NbdConnection).

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use tokio::net::{TcpListener, UnixListener};
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::connection::NbdConnection;
use super::{Export, ExportConfig, ServerConfig, ServerError, ServerResult, ServerState, VolumeIO};

/// NBD server
pub struct NbdServer {
    /// Server configuration
    config: ServerConfig,
    /// Exports in registration order
    exports: Vec<Arc<Export>>,
}

impl NbdServer {
    /// Create a new NBD server
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            exports: Vec::new(),
        }
    }

    /// Register an export; a later export with the same name is shadowed
    pub fn export(mut self, config: ExportConfig, volume: Arc<dyn VolumeIO>) -> Self {
        self.exports.push(Arc::new(Export { config, volume }));
        self
    }

    /// Names of all exports
    pub fn export_names(&self) -> Vec<&str> {
        self.exports.iter().map(|e| e.config.name.as_str()).collect()
    }

    /// Listen on a TCP address (port 0 picks a free port)
    pub fn serve_tcp(self, addr: SocketAddr) -> ServerResult<ServerHandle> {
        let runtime = self.runtime()?;
        let listener = runtime.block_on(TcpListener::bind(addr))?;
        let local = listener.local_addr()?;
        info!("NBD server listening on {}", local);
        self.start(runtime, Listener::Tcp(listener), ServerAddress::Tcp(local))
    }

    /// Listen on a Unix domain socket
    pub fn serve_unix(self, path: impl AsRef<Path>) -> ServerResult<ServerHandle> {
        let path = path.as_ref().to_path_buf();
        let runtime = self.runtime()?;
        let listener = {
            let _guard = runtime.enter();
            UnixListener::bind(&path)?
        };
        info!("NBD server listening on {}", path.display());
        self.start(runtime, Listener::Unix(listener), ServerAddress::Unix(path))
    }

    fn runtime(&self) -> ServerResult<Runtime> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.worker_threads.max(1))
            .thread_name("nbd-server")
            .enable_all()
            .build()
            .map_err(|e| ServerError::Startup(e.to_string()))
    }

    fn start(
        self,
        runtime: Runtime,
        listener: Listener,
        address: ServerAddress,
    ) -> ServerResult<ServerHandle> {
        let state = Arc::new(ServerState {
            config: self.config,
            exports: self.exports,
        });
        let connections = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let counter = connections.clone();
        let thread = thread::Builder::new()
            .name("nbd-server-main".to_string())
            .spawn(move || runtime.block_on(accept_loop(listener, state, counter, shutdown_rx)))
            .map_err(|e| ServerError::Startup(e.to_string()))?;

        Ok(ServerHandle {
            address,
            connections,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Accept one client and spawn its connection task
    async fn accept(&self, state: &Arc<ServerState>) -> std::io::Result<()> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                debug!("Accepted NBD connection from {}", addr);
                spawn_connection(NbdConnection::new(stream), state.clone());
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                debug!("Accepted NBD connection on unix socket");
                spawn_connection(NbdConnection::new(stream), state.clone());
            }
        }
        Ok(())
    }
}

fn spawn_connection<S>(connection: NbdConnection<S>, state: Arc<ServerState>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.run(state).await {
            warn!("NBD connection ended with error: {}", e);
        }
    });
}

async fn accept_loop(
    listener: Listener,
    state: Arc<ServerState>,
    connections: Arc<AtomicU64>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!("NBD server shutting down");
                break;
            }
            accepted = listener.accept(&state) => match accepted {
                Ok(()) => {
                    connections.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("Failed to accept NBD connection: {}", e);
                }
            }
        }
    }
}

/// Where a running server listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddress {
    /// TCP socket address
    Tcp(SocketAddr),
    /// Unix socket path
    Unix(PathBuf),
}

impl ServerAddress {
    /// NBD URI naming `export` on this server
    pub fn uri(&self, export: &str) -> String {
        match self {
            ServerAddress::Tcp(addr) => format!("nbd://{}/{}", addr, export),
            ServerAddress::Unix(path) => {
                format!("nbd+unix:///{}?socket={}", export, path.display())
            }
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerAddress::Tcp(addr) => write!(f, "{}", addr),
            ServerAddress::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Running server; stops when dropped
pub struct ServerHandle {
    address: ServerAddress,
    connections: Arc<AtomicU64>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
    /// Listening address
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// TCP address, if listening on TCP
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        match self.address {
            ServerAddress::Tcp(addr) => Some(addr),
            ServerAddress::Unix(_) => None,
        }
    }

    /// NBD URI naming `export` on this server
    pub fn uri(&self, export: &str) -> String {
        self.address.uri(export)
    }

    /// Connections accepted so far
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Stop accepting and tear down every connection
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("NBD server thread panicked");
            }
        }
        if let ServerAddress::Unix(path) = &self.address {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("address", &self.address)
            .field("connections", &self.connection_count())
            .finish()
    }
}
