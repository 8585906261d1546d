//! Main runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: registry → allocations (+ sweeper) → power → federation
//!   (+ poller) → broker listener
//! - Shutdown order: listener → federation → power → allocations

use crate::adapters::{Adapter, BrokerAdapter, BrokerService};
use crate::alloc::{spawn_sweeper, AllocationManager};
use crate::core::config::Config;
use crate::core::time::{Clock, SystemClock};
use crate::federation::{spawn_poller, FederationGateway, LocalBroker, TcpRemoteBroker};
use crate::net::tcp::TcpListenerConfig;
use crate::power::{driver_for, PowerController, PowerDriver};
use crate::registry::TargetRegistry;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    Starting,
    Healthy,
    /// Functional with reduced capability.
    Degraded,
    Failed,
    Stopping,
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    pub registry: ComponentHealth,
    pub allocations: ComponentHealth,
    pub power: ComponentHealth,
    pub federation: ComponentHealth,
    pub listener: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            registry: ComponentHealth::Starting,
            allocations: ComponentHealth::Starting,
            power: ComponentHealth::Starting,
            federation: ComponentHealth::Starting,
            listener: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Ready to serve requests. A degraded federation does not block.
    pub fn is_ready(&self) -> bool {
        matches!(
            (
                self.registry,
                self.allocations,
                self.power,
                self.federation,
                self.listener
            ),
            (
                ComponentHealth::Healthy,
                ComponentHealth::Healthy,
                ComponentHealth::Healthy,
                ComponentHealth::Healthy | ComponentHealth::Degraded,
                ComponentHealth::Healthy
            )
        )
    }

    pub fn is_alive(&self) -> bool {
        ![self.registry, self.allocations, self.power, self.listener]
            .contains(&ComponentHealth::Failed)
    }
}

/// Broker runtime holding all component handles.
pub struct Runtime {
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    health: RuntimeHealth,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    registry: Option<Arc<TargetRegistry>>,
    manager: Option<Arc<AllocationManager>>,
    power: Option<Arc<PowerController>>,
    gateway: Option<Arc<FederationGateway>>,
    service: Option<BrokerService>,
    adapter: Option<BrokerAdapter>,

    sweeper: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
}

impl Runtime {
    /// Create a runtime on the system clock.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a runtime on a caller-supplied clock.
    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config: Arc::new(config),
            clock,
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
            registry: None,
            manager: None,
            power: None,
            gateway: None,
            service: None,
            adapter: None,
            sweeper: None,
            poller: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    pub fn is_ready(&self) -> bool {
        self.health.is_ready()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn registry(&self) -> Option<&Arc<TargetRegistry>> {
        self.registry.as_ref()
    }

    pub fn manager(&self) -> Option<&Arc<AllocationManager>> {
        self.manager.as_ref()
    }

    pub fn power(&self) -> Option<&Arc<PowerController>> {
        self.power.as_ref()
    }

    pub fn gateway(&self) -> Option<&Arc<FederationGateway>> {
        self.gateway.as_ref()
    }

    pub fn service(&self) -> Option<&BrokerService> {
        self.service.as_ref()
    }

    /// Address the broker listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.adapter.as_ref().and_then(BrokerAdapter::local_addr)
    }

    /// Initialize and start all components.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            server = %self.config.server.id,
            targets = self.config.targets.len(),
            "starting corral runtime"
        );
        self.init_core()?;
        self.init_federation();
        self.start_listener().await?;
        self.running.store(true, Ordering::Release);
        tracing::info!("corral runtime started");
        Ok(())
    }

    /// Registry, allocation manager and power controller.
    fn init_core(&mut self) -> Result<()> {
        let registry = Arc::new(
            TargetRegistry::new(&self.config.targets).context("failed to build target registry")?,
        );
        self.health.registry = ComponentHealth::Healthy;

        let manager = Arc::new(AllocationManager::new(
            self.config.server.id.clone(),
            Arc::clone(&registry),
            Arc::clone(&self.clock),
            self.config.allocation.clone(),
        ));
        self.sweeper = Some(spawn_sweeper(
            Arc::clone(&manager),
            Duration::from_millis(self.config.allocation.sweep_period_ms),
            self.shutdown_rx.clone(),
        ));
        self.health.allocations = ComponentHealth::Healthy;

        let driver: Arc<dyn PowerDriver> = driver_for(
            &self.config.power.driver,
            Duration::from_millis(self.config.power.simulated_latency_ms),
        )
        .context("failed to create power driver")?;
        tracing::info!(driver = driver.name(), "power driver ready");
        let power = Arc::new(PowerController::new(
            Arc::clone(&manager),
            driver,
            &self.config.power,
        ));
        self.health.power = ComponentHealth::Healthy;

        self.service = Some(BrokerService::new(
            Arc::clone(&manager),
            Arc::clone(&power),
            self.config.auth.admins.iter().cloned(),
        ));
        self.registry = Some(registry);
        self.manager = Some(manager);
        self.power = Some(power);
        Ok(())
    }

    /// Federation gateway with the local broker and configured remotes.
    fn init_federation(&mut self) {
        let Some(local) = self.service.clone() else {
            self.health.federation = ComponentHealth::Failed;
            return;
        };
        let fed = &self.config.federation;
        let gateway = Arc::new(FederationGateway::new(self.config.server.id.clone(), fed));
        gateway.register(Arc::new(LocalBroker::new(local.clone())));
        for remote in &fed.remotes {
            gateway.register(Arc::new(TcpRemoteBroker::new(
                remote.id.clone(),
                remote.address.clone(),
                Duration::from_millis(fed.request_timeout_ms),
            )));
        }
        self.poller = Some(spawn_poller(
            Arc::clone(&gateway),
            Duration::from_millis(fed.poll_interval_ms),
            self.shutdown_rx.clone(),
        ));
        self.service = Some(local.with_federation(Arc::clone(&gateway)));
        self.gateway = Some(gateway);
        self.health.federation = ComponentHealth::Healthy;
        tracing::info!(remotes = fed.remotes.len(), "federation gateway initialized");
    }

    async fn start_listener(&mut self) -> Result<()> {
        let service = self
            .service
            .clone()
            .context("broker service not initialized")?;
        let config = TcpListenerConfig {
            bind_addr: self.config.bind_addr()?,
            max_connections: self.config.server.max_connections,
            idle_timeout: Duration::from_millis(self.config.server.connection_idle_timeout_ms),
            nodelay: true,
        };
        let adapter = BrokerAdapter::new(config, service);
        if let Err(e) = adapter.start().await {
            self.health.listener = ComponentHealth::Failed;
            return Err(anyhow::Error::new(e).context("failed to start broker listener"));
        }
        self.adapter = Some(adapter);
        self.health.listener = ComponentHealth::Healthy;
        Ok(())
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Run until SIGINT or a shutdown request.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop().await
    }

    /// Stop all components in reverse start order.
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping corral runtime");
        self.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        self.health.listener = ComponentHealth::Stopping;
        if let Some(adapter) = self.adapter.take() {
            adapter.stop().await?;
        }
        self.health.listener = ComponentHealth::Stopped;

        self.health.federation = ComponentHealth::Stopping;
        if let Some(poller) = self.poller.take() {
            let _ = poller.await;
        }
        self.health.federation = ComponentHealth::Stopped;

        self.health.power = ComponentHealth::Stopped;

        self.health.allocations = ComponentHealth::Stopping;
        if let Some(sweeper) = self.sweeper.take() {
            let _ = sweeper.await;
        }
        self.health.allocations = ComponentHealth::Stopped;
        self.health.registry = ComponentHealth::Stopped;

        tracing::info!("corral runtime stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_tolerates_degraded_federation() {
        let mut health = RuntimeHealth {
            registry: ComponentHealth::Healthy,
            allocations: ComponentHealth::Healthy,
            power: ComponentHealth::Healthy,
            federation: ComponentHealth::Degraded,
            listener: ComponentHealth::Healthy,
        };
        assert!(health.is_ready());
        health.listener = ComponentHealth::Failed;
        assert!(!health.is_ready());
        assert!(!health.is_alive());
    }
}
