//! Broker protocol adapter.
//!
//! Owns the TCP listener and spawns one task per connection.

use super::connection::{serve_connection, ConnectionStats, ServerCodec};
use super::service::BrokerService;
use super::{Adapter, AdapterHealth, AdapterState};
use crate::core::error::{CorralError, CorralResult};
use crate::net::tcp::{Accepted, TcpListener, TcpListenerConfig};
use parking_lot::RwLock;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Serves the line protocol on one address.
pub struct BrokerAdapter {
    config: TcpListenerConfig,
    service: BrokerService,
    state: Arc<RwLock<AdapterState>>,
    stats: Arc<ConnectionStats>,
    listener: Arc<TcpListener>,
    shutdown_tx: watch::Sender<bool>,
    local_addr: RwLock<Option<SocketAddr>>,
    last_error: Arc<RwLock<Option<String>>>,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl BrokerAdapter {
    pub fn new(config: TcpListenerConfig, service: BrokerService) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = Arc::new(TcpListener::new(config.clone(), shutdown_rx));
        Self {
            config,
            service,
            state: Arc::new(RwLock::new(AdapterState::Created)),
            stats: Arc::new(ConnectionStats::default()),
            listener,
            shutdown_tx,
            local_addr: RwLock::new(None),
            last_error: Arc::new(RwLock::new(None)),
            accept_task: parking_lot::Mutex::new(None),
        }
    }

    /// Address actually bound (differs from the configured one for port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    async fn run(&self) -> CorralResult<()> {
        *self.state.write() = AdapterState::Starting;
        let socket = match self.listener.bind().await {
            Ok(socket) => socket,
            Err(e) => {
                *self.state.write() = AdapterState::Failed;
                *self.last_error.write() = Some(e.to_string());
                return Err(e);
            }
        };
        let local = socket
            .local_addr()
            .map_err(|e| CorralError::internal(format!("local_addr: {}", e)))?;
        *self.local_addr.write() = Some(local);
        tracing::info!(addr = %local, "broker listening");

        let listener = Arc::clone(&self.listener);
        let service = self.service.clone();
        let stats = Arc::clone(&self.stats);
        let state = Arc::clone(&self.state);
        let last_error = Arc::clone(&self.last_error);
        let idle_timeout = self.config.idle_timeout;
        let shutdown_rx = self.shutdown_tx.subscribe();
        let codec = Arc::new(ServerCodec::new());

        let task = tokio::spawn(async move {
            loop {
                match listener.accept(&socket).await {
                    Ok(Accepted::Connection(connection)) => {
                        let listener = Arc::clone(&listener);
                        let service = service.clone();
                        let codec = Arc::clone(&codec);
                        let stats = Arc::clone(&stats);
                        let shutdown_rx = shutdown_rx.clone();
                        tokio::spawn(async move {
                            let id = connection.id;
                            if let Err(e) = serve_connection(
                                connection,
                                service,
                                codec,
                                stats,
                                idle_timeout,
                                shutdown_rx,
                            )
                            .await
                            {
                                tracing::debug!(connection = %id, error = %e, "connection error");
                            }
                            listener.connection_closed();
                        });
                    }
                    Ok(Accepted::Rejected(peer)) => {
                        tracing::warn!(peer = %peer, "connection limit reached, rejecting");
                    }
                    Ok(Accepted::Shutdown) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        *last_error.write() = Some(e.to_string());
                    }
                }
            }
            listener.stopped();
            *state.write() = AdapterState::Stopped;
            tracing::info!("broker listener stopped");
        });
        *self.accept_task.lock() = Some(task);
        *self.state.write() = AdapterState::Running;
        Ok(())
    }
}

impl Adapter for BrokerAdapter {
    fn name(&self) -> &'static str {
        "broker"
    }

    fn state(&self) -> AdapterState {
        *self.state.read()
    }

    fn health(&self) -> AdapterHealth {
        let metrics = self.listener.metrics();
        AdapterHealth {
            state: self.state(),
            active_connections: metrics.active_connections() as usize,
            total_requests: self.stats.requests_processed.load(Ordering::Relaxed),
            failed_requests: self.stats.requests_failed.load(Ordering::Relaxed),
            last_error: self.last_error.read().clone(),
        }
    }

    fn start(&self) -> Pin<Box<dyn Future<Output = CorralResult<()>> + Send + '_>> {
        Box::pin(self.run())
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = CorralResult<()>> + Send + '_>> {
        Box::pin(async move {
            *self.state.write() = AdapterState::ShuttingDown;
            let _ = self.shutdown_tx.send(true);
            let task = self.accept_task.lock().take();
            if let Some(task) = task {
                let _ = task.await;
            }
            *self.state.write() = AdapterState::Stopped;
            Ok(())
        })
    }

    fn bind_addr(&self) -> SocketAddr {
        self.local_addr().unwrap_or(self.config.bind_addr)
    }
}
