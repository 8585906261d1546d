//! Broker request dispatch.
//!
//! Maps decoded [`BrokerRequest`]s onto the allocation manager, the power
//! controller and (when attached) the federation gateway. The wire adapter
//! and the in-process [`LocalBroker`](crate::federation::LocalBroker) both go
//! through here, so local and remote callers see identical semantics.

use super::protocol::{BrokerRequest, Envelope, ResponseBody};
use crate::alloc::{AllocationManager, Caller};
use crate::core::error::{CorralError, CorralResult};
use crate::federation::FederationGateway;
use crate::power::{ComponentSelector, PowerController};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Request handler shared by every connection.
#[derive(Clone)]
pub struct BrokerService {
    manager: Arc<AllocationManager>,
    power: Arc<PowerController>,
    admins: Arc<HashSet<String>>,
    federation: Option<Arc<FederationGateway>>,
}

impl BrokerService {
    pub fn new<I, S>(manager: Arc<AllocationManager>, power: Arc<PowerController>, admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            manager,
            power,
            admins: Arc::new(admins.into_iter().map(Into::into).collect()),
            federation: None,
        }
    }

    /// Serve `federated_listing` and forwarded requests from this gateway.
    pub fn with_federation(mut self, gateway: Arc<FederationGateway>) -> Self {
        self.federation = Some(gateway);
        self
    }

    pub fn server_id(&self) -> &str {
        self.manager.server_id()
    }

    pub fn manager(&self) -> &Arc<AllocationManager> {
        &self.manager
    }

    /// Resolve a user name to a caller with its capabilities.
    pub fn caller(&self, user: &str) -> CorralResult<Caller> {
        if user.trim().is_empty() {
            return Err(CorralError::forbidden("request carries no user"));
        }
        Ok(Caller {
            user: user.to_string(),
            admin: self.admins.contains(user),
        })
    }

    /// Execute one request on behalf of `user`.
    pub async fn handle(&self, user: &str, request: BrokerRequest) -> CorralResult<ResponseBody> {
        let op = request.op();
        let result = self.execute(user, request).await;
        if let Err(e) = &result {
            tracing::debug!(op, user = %user, error = %e, "request failed");
        }
        result
    }

    /// Execute a decoded envelope, forwarding it when it names another server.
    pub async fn handle_envelope(&self, envelope: Envelope) -> CorralResult<ResponseBody> {
        match envelope.server.as_deref() {
            Some(server) if server != self.server_id() => {
                self.forward(server, &envelope.user, envelope.request).await
            }
            _ => self.handle(&envelope.user, envelope.request).await,
        }
    }

    async fn forward(
        &self,
        server: &str,
        user: &str,
        request: BrokerRequest,
    ) -> CorralResult<ResponseBody> {
        self.caller(user)?;
        let Some(gateway) = &self.federation else {
            return Err(CorralError::invalid(format!(
                "cannot forward to {}: federation is not enabled on this server",
                server
            )));
        };
        let op = request.op();
        let result = gateway.dispatch(server, user, request).await;
        match &result {
            Ok(_) => tracing::debug!(server = %server, user = %user, op, "forwarded request"),
            Err(e) => {
                tracing::debug!(server = %server, user = %user, op, error = %e, "forwarded request failed")
            }
        }
        result
    }

    async fn execute(&self, user: &str, request: BrokerRequest) -> CorralResult<ResponseBody> {
        let caller = self.caller(user)?;
        match request {
            BrokerRequest::ListTargets => {
                Ok(ResponseBody::targets(self.manager.registry().list()))
            }
            BrokerRequest::ListAllocations => Ok(ResponseBody::allocations(self.manager.list())),
            BrokerRequest::Acquire(req) => self
                .manager
                .acquire(&caller, req)
                .map(ResponseBody::allocation),
            BrokerRequest::Release { allocation_id } => self
                .manager
                .release(&caller, allocation_id)
                .map(ResponseBody::allocation),
            BrokerRequest::Keepalive { allocation_id } => self
                .manager
                .keepalive(&caller, allocation_id)
                .map(ResponseBody::allocation),
            BrokerRequest::Wait {
                allocation_id,
                timeout_ms,
            } => {
                let cap = self.manager.config().queue_max_wait_ms;
                let timeout = Duration::from_millis(timeout_ms.min(cap));
                self.manager
                    .wait(allocation_id, timeout)
                    .await
                    .map(ResponseBody::allocation)
            }
            BrokerRequest::AddGuest {
                allocation_id,
                guest,
            } => self
                .manager
                .add_guest(&caller, allocation_id, &guest)
                .map(ResponseBody::allocation),
            BrokerRequest::RemoveGuest {
                allocation_id,
                guest,
            } => self
                .manager
                .remove_guest(&caller, allocation_id, &guest)
                .map(ResponseBody::allocation),
            BrokerRequest::Power {
                target,
                component,
                command,
            } => self
                .power
                .set_power(&target, ComponentSelector::parse(&component), command, &caller)
                .await
                .map(ResponseBody::power),
            BrokerRequest::GetPower { target } => {
                self.power.get_power(&target).map(ResponseBody::components)
            }
            BrokerRequest::Listing => Ok(ResponseBody::listing(
                self.server_id(),
                self.manager.registry().list(),
                self.manager.list(),
            )),
            BrokerRequest::FederatedListing => match &self.federation {
                Some(gateway) => Ok(ResponseBody::federation(gateway.view())),
                None => Err(CorralError::invalid("federation is not enabled on this server")),
            },
        }
    }
}
