//! Multi-server federation.
//!
//! The gateway treats the local broker and remote brokers alike through the
//! [`RemoteBroker`] trait and merges their listings into one
//! [`FederatedView`] tagged by server.

pub mod broker;
pub mod cache;
pub mod gateway;

pub use broker::{BrokerFuture, LocalBroker, RemoteBroker, TcpRemoteBroker};
pub use cache::{CacheState, CachedValue};
pub use gateway::{
    spawn_poller, FederatedView, FederationGateway, ServerHealth, ServerStatus, Tagged,
};
