//! Broker endpoints the gateway can talk to.

use crate::adapters::client::BrokerClient;
use crate::adapters::protocol::{BrokerRequest, ResponseBody};
use crate::adapters::service::BrokerService;
use crate::core::error::CorralResult;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Future returned by broker calls.
pub type BrokerFuture<'a> = Pin<Box<dyn Future<Output = CorralResult<ResponseBody>> + Send + 'a>>;

/// A broker server reachable by the gateway.
pub trait RemoteBroker: Send + Sync {
    /// Server id.
    fn id(&self) -> &str;

    /// Execute a request as `user`.
    fn call<'a>(&'a self, user: &'a str, request: BrokerRequest) -> BrokerFuture<'a>;
}

/// The broker running in this process.
pub struct LocalBroker {
    id: String,
    service: BrokerService,
}

impl LocalBroker {
    pub fn new(service: BrokerService) -> Self {
        Self {
            id: service.server_id().to_string(),
            service,
        }
    }
}

impl RemoteBroker for LocalBroker {
    fn id(&self) -> &str {
        &self.id
    }

    fn call<'a>(&'a self, user: &'a str, request: BrokerRequest) -> BrokerFuture<'a> {
        Box::pin(self.service.handle(user, request))
    }
}

/// A broker reached over the line protocol. Connects per call.
pub struct TcpRemoteBroker {
    id: String,
    address: String,
    connect_timeout: Duration,
}

impl TcpRemoteBroker {
    pub fn new(id: impl Into<String>, address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            connect_timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl RemoteBroker for TcpRemoteBroker {
    fn id(&self) -> &str {
        &self.id
    }

    fn call<'a>(&'a self, user: &'a str, request: BrokerRequest) -> BrokerFuture<'a> {
        Box::pin(async move {
            let mut client =
                BrokerClient::connect(&self.address, user, self.connect_timeout).await?;
            client.call(request).await
        })
    }
}
