//! TCP accept loop and per-connection task spawning

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::protocol::{Framing, ServerFrame};

use super::error::ServerError;
use super::handler::{wait_for_shutdown, ConnectionHandler};
use super::registry::RoomRegistry;

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_addr: String,
    /// How clients mark audio on the uplink
    pub framing: Framing,
    /// Largest read relayed as one frame under legacy framing
    pub relay_chunk_size: usize,
    /// Legacy reads shorter than this are checked for commands
    pub legacy_text_limit: usize,
    /// Frames queued per connection before broadcasts to it start failing
    pub outbound_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".to_string(),
            framing: Framing::Tagged,
            relay_chunk_size: 4096,
            legacy_text_limit: 300,
            outbound_queue: 64,
        }
    }
}

/// Requests a running server to stop
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Stop accepting and close every connection
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// Room-based audio relay server
pub struct RelayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: RoomRegistry,
    config: Arc<ServerConfig>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RelayServer {
    /// Bind the listening socket with SO_REUSEADDR enabled
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let addr: SocketAddr = config.bind_addr.parse()?;

        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

        // Allow an immediate restart on the same port
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;

        info!("Relay server bound to {} ({} framing)", local_addr, config.framing);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            listener,
            local_addr,
            registry: RoomRegistry::new(),
            config: Arc::new(config),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared handle on the room registry
    pub fn registry(&self) -> RoomRegistry {
        self.registry.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Accept connections until shutdown is requested
    ///
    /// Each connection gets its own handler task and writer task; the accept
    /// loop never waits on either.
    pub async fn run(self) -> Result<(), ServerError> {
        info!("Relay server listening on {}", self.local_addr);
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        info!("Client connected from {}", peer_addr);
                        self.spawn_connection(stream, peer_addr);
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                },
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("Relay server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(self.config.outbound_queue.max(1));

        tokio::spawn(run_writer(write_half, rx, peer_addr));

        let handler = ConnectionHandler::new(
            BufReader::new(read_half),
            tx,
            self.registry.clone(),
            self.config.clone(),
            peer_addr.to_string(),
        );
        let shutdown = self.shutdown_rx.clone();

        tokio::spawn(async move {
            match handler.run(shutdown).await {
                Ok(()) => debug!("Connection {} closed", peer_addr),
                Err(e) => debug!("Connection {} lost: {}", peer_addr, e),
            }
        });
    }
}

/// Drain one connection's queue onto its socket
///
/// Ends when every sender is gone or a write fails, then shuts the socket down.
async fn run_writer(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<ServerFrame>,
    peer_addr: SocketAddr,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = frame.write_to(&mut writer).await {
            debug!("Write to {} failed: {}", peer_addr, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}
