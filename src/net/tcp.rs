//! TCP listener.
//!
//! Accepts plaintext connections for the broker line protocol, enforcing a
//! connection cap and stopping on the shared shutdown signal.

use crate::core::error::{CorralError, CorralResult};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::watch;

/// TCP listener configuration.
#[derive(Debug, Clone)]
pub struct TcpListenerConfig {
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Connections idle longer than this are closed.
    pub idle_timeout: Duration,

    /// Disable Nagle's algorithm.
    pub nodelay: bool,
}

impl Default for TcpListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7420)),
            max_connections: 1024,
            idle_timeout: Duration::from_secs(300),
            nodelay: true,
        }
    }
}

/// Listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpListenerState {
    Created,
    Listening,
    ShuttingDown,
    Stopped,
}

/// Connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// An accepted connection.
pub struct TcpConnection {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    stream: TcpStream,
}

impl TcpConnection {
    pub fn into_split(
        self,
    ) -> (
        tokio::net::tcp::OwnedReadHalf,
        tokio::net::tcp::OwnedWriteHalf,
    ) {
        self.stream.into_split()
    }
}

/// What a call to [`TcpListener::accept`] produced.
pub enum Accepted {
    Connection(TcpConnection),
    /// Dropped because the listener is at capacity.
    Rejected(SocketAddr),
    /// Shutdown was signalled.
    Shutdown,
}

/// Listener counters.
#[derive(Debug, Default)]
pub struct TcpListenerMetrics {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
}

impl TcpListenerMetrics {
    pub fn connection_accepted(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }
}

/// TCP listener for accepting connections.
pub struct TcpListener {
    config: TcpListenerConfig,
    state: RwLock<TcpListenerState>,
    next_conn_id: AtomicU64,
    shutdown_rx: watch::Receiver<bool>,
    metrics: Arc<TcpListenerMetrics>,
}

impl TcpListener {
    pub fn new(config: TcpListenerConfig, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            config,
            state: RwLock::new(TcpListenerState::Created),
            next_conn_id: AtomicU64::new(1),
            shutdown_rx,
            metrics: Arc::new(TcpListenerMetrics::default()),
        }
    }

    pub fn config(&self) -> &TcpListenerConfig {
        &self.config
    }

    pub fn state(&self) -> TcpListenerState {
        *self.state.read()
    }

    pub fn metrics(&self) -> &Arc<TcpListenerMetrics> {
        &self.metrics
    }

    pub fn at_capacity(&self) -> bool {
        self.metrics.active_connections() >= self.config.max_connections as u64
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> CorralResult<TokioTcpListener> {
        let listener = TokioTcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| {
                CorralError::internal(format!(
                    "failed to bind to {}: {}",
                    self.config.bind_addr, e
                ))
            })?;
        *self.state.write() = TcpListenerState::Listening;
        Ok(listener)
    }

    /// Wait for the next connection or shutdown.
    pub async fn accept(&self, listener: &TokioTcpListener) -> CorralResult<Accepted> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        if *shutdown_rx.borrow() {
            return Ok(Accepted::Shutdown);
        }

        tokio::select! {
            result = listener.accept() => {
                let (stream, addr) = result
                    .map_err(|e| CorralError::internal(format!("accept failed: {}", e)))?;
                if self.at_capacity() {
                    self.metrics.connection_rejected();
                    return Ok(Accepted::Rejected(addr));
                }
                if self.config.nodelay {
                    let _ = stream.set_nodelay(true);
                }
                let id = ConnectionId(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
                self.metrics.connection_accepted();
                Ok(Accepted::Connection(TcpConnection {
                    id,
                    remote_addr: addr,
                    stream,
                }))
            }
            _ = shutdown_rx.changed() => {
                *self.state.write() = TcpListenerState::ShuttingDown;
                Ok(Accepted::Shutdown)
            }
        }
    }

    pub fn stopped(&self) {
        *self.state.write() = TcpListenerState::Stopped;
    }

    pub fn connection_closed(&self) {
        self.metrics.connection_closed();
    }
}
