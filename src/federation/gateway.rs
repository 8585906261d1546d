//! Federation gateway.
//!
//! Aggregates target and allocation listings from several independent broker
//! servers. Every server is queried concurrently with its own timeout, so a
//! slow or dead server only degrades its own part of the view. The last good
//! listing per server is cached and served until it expires.

use super::broker::RemoteBroker;
use super::cache::{CacheState, CachedValue};
use crate::adapters::protocol::{BrokerRequest, ResponseBody};
use crate::alloc::AllocationView;
use crate::core::config::FederationConfig;
use crate::core::error::{CorralError, CorralResult};
use crate::registry::TargetView;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A record tagged with the server it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tagged<T> {
    pub server: String,
    pub record: T,
}

/// Outcome of the most recent query to a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerHealth {
    /// Not queried yet.
    Unknown,
    Ok,
    Failed,
    TimedOut,
}

/// Per-server status in a federated view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub server: String,
    pub health: ServerHealth,
    /// Error of the last failed query.
    pub error: Option<String>,
    /// Freshness of the cached listing, if one exists.
    pub freshness: Option<CacheState>,
    pub age_ms: Option<u64>,
}

impl ServerStatus {
    /// Whether this server contributed records to the view.
    pub fn contributes(&self) -> bool {
        self.freshness.map(|f| f.is_servable()).unwrap_or(false)
    }
}

/// Aggregated view across servers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederatedView {
    pub targets: Vec<Tagged<TargetView>>,
    pub allocations: Vec<Tagged<AllocationView>>,
    pub servers: Vec<ServerStatus>,
}

impl FederatedView {
    pub fn server(&self, id: &str) -> Option<&ServerStatus> {
        self.servers.iter().find(|s| s.server == id)
    }
}

#[derive(Debug, Clone)]
struct Listing {
    targets: Vec<TargetView>,
    allocations: Vec<AllocationView>,
}

struct ServerEntry {
    broker: Arc<dyn RemoteBroker>,
    cache: Option<CachedValue<Listing>>,
    health: ServerHealth,
    error: Option<String>,
}

/// Fans listing queries out to every known server.
pub struct FederationGateway {
    /// Identity used for listing queries.
    user: String,
    servers: RwLock<BTreeMap<String, ServerEntry>>,
    request_timeout: Duration,
    ttl_ms: u64,
    grace_ms: u64,
}

impl FederationGateway {
    pub fn new(user: impl Into<String>, config: &FederationConfig) -> Self {
        Self {
            user: user.into(),
            servers: RwLock::new(BTreeMap::new()),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            ttl_ms: config.cache_ttl_seconds * 1000,
            grace_ms: config.grace_seconds * 1000,
        }
    }

    /// Add a server, replacing any with the same id.
    pub fn register(&self, broker: Arc<dyn RemoteBroker>) {
        let id = broker.id().to_string();
        tracing::info!(server = %id, "federation server registered");
        self.servers.write().insert(
            id,
            ServerEntry {
                broker,
                cache: None,
                health: ServerHealth::Unknown,
                error: None,
            },
        );
    }

    /// Remove a server and its cached listing.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.servers.write().remove(id).is_some();
        if removed {
            tracing::info!(server = %id, "federation server unregistered");
        }
        removed
    }

    /// Known server ids.
    pub fn servers(&self) -> Vec<String> {
        self.servers.read().keys().cloned().collect()
    }

    /// Query every server concurrently and update the caches.
    pub async fn refresh(&self) -> Vec<ServerStatus> {
        let brokers: Vec<(String, Arc<dyn RemoteBroker>)> = self
            .servers
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(&entry.broker)))
            .collect();

        let mut tasks = Vec::with_capacity(brokers.len());
        for (id, broker) in brokers {
            let user = self.user.clone();
            let timeout = self.request_timeout;
            let task = tokio::spawn(async move {
                tokio::time::timeout(timeout, broker.call(&user, BrokerRequest::Listing)).await
            });
            tasks.push((id, task));
        }

        for (id, task) in tasks {
            let outcome = match task.await {
                Ok(Ok(Ok(body))) => listing_from(body),
                Ok(Ok(Err(e))) => Err((ServerHealth::Failed, e.to_string())),
                Ok(Err(_)) => Err((
                    ServerHealth::TimedOut,
                    format!("no answer within {}ms", self.request_timeout.as_millis()),
                )),
                Err(e) => Err((ServerHealth::Failed, format!("query task failed: {}", e))),
            };

            let mut servers = self.servers.write();
            let Some(entry) = servers.get_mut(&id) else {
                continue;
            };
            match outcome {
                Ok(listing) => {
                    match entry.cache.as_mut() {
                        Some(cache) => cache.update(listing),
                        None => {
                            entry.cache = Some(CachedValue::new(listing, self.ttl_ms, self.grace_ms))
                        }
                    }
                    entry.health = ServerHealth::Ok;
                    entry.error = None;
                }
                Err((health, error)) => {
                    tracing::warn!(server = %id, health = ?health, error = %error, "listing query failed");
                    entry.health = health;
                    entry.error = Some(error);
                }
            }
        }

        let statuses = self.statuses();
        tracing::debug!(
            servers = statuses.len(),
            responding = statuses.iter().filter(|s| s.health == ServerHealth::Ok).count(),
            "federation refresh complete"
        );
        statuses
    }

    /// Current aggregated view from the caches. Expired listings are dropped.
    pub fn view(&self) -> FederatedView {
        let servers = self.servers.read();
        let mut view = FederatedView::default();
        for (id, entry) in servers.iter() {
            view.servers.push(status_of(id, entry));
            let Some(cache) = &entry.cache else {
                continue;
            };
            if !cache.state().is_servable() {
                continue;
            }
            let listing = cache.get();
            view.targets.extend(listing.targets.iter().map(|t| Tagged {
                server: id.clone(),
                record: t.clone(),
            }));
            view.allocations
                .extend(listing.allocations.iter().map(|a| Tagged {
                    server: id.clone(),
                    record: a.clone(),
                }));
        }
        view
    }

    /// Route a request to one server.
    pub async fn dispatch(
        &self,
        server: &str,
        user: &str,
        request: BrokerRequest,
    ) -> CorralResult<ResponseBody> {
        let broker = self
            .servers
            .read()
            .get(server)
            .map(|entry| Arc::clone(&entry.broker))
            .ok_or_else(|| CorralError::ServerUnavailable {
                server: server.to_string(),
                message: "server is not registered".to_string(),
            })?;
        tracing::debug!(server = %server, user = %user, op = request.op(), "dispatching request");
        broker.call(user, request).await
    }

    fn statuses(&self) -> Vec<ServerStatus> {
        self.servers
            .read()
            .iter()
            .map(|(id, entry)| status_of(id, entry))
            .collect()
    }
}

fn status_of(id: &str, entry: &ServerEntry) -> ServerStatus {
    ServerStatus {
        server: id.to_string(),
        health: entry.health,
        error: entry.error.clone(),
        freshness: entry.cache.as_ref().map(CachedValue::state),
        age_ms: entry.cache.as_ref().map(CachedValue::age_ms),
    }
}

fn listing_from(body: ResponseBody) -> Result<Listing, (ServerHealth, String)> {
    match (body.targets, body.allocations) {
        (Some(targets), Some(allocations)) => Ok(Listing {
            targets,
            allocations,
        }),
        _ => Err((
            ServerHealth::Failed,
            "listing response is missing targets or allocations".to_string(),
        )),
    }
}

/// Refresh the gateway every `period` until shutdown.
pub fn spawn_poller(
    gateway: Arc<FederationGateway>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    gateway.refresh().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("federation poller stopped");
    })
}
