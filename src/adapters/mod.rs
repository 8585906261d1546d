//! Protocol adapters.
//!
//! The broker speaks one wire protocol: newline-delimited JSON over TCP.
//!
//! ```text
//! ┌──────────┐   Envelope{user, request}   ┌───────────────┐
//! │  client  │ ──────────────────────────▶ │ BrokerAdapter │
//! │ (CLI,    │                             │   per-conn    │
//! │  remote  │ ◀────────────────────────── │   task        │
//! │  broker) │   {"status": "ok"|"error"}  └───────┬───────┘
//! └──────────┘                                     │
//!                                          ┌───────▼───────┐
//!                                          │ BrokerService │
//!                                          └───────────────┘
//! ```
//!
//! The user in the envelope is trusted as established by whatever fronts the
//! socket; the adapter itself does not authenticate. An envelope that names
//! another federated server is forwarded there by the service.

use crate::core::error::CorralResult;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

pub mod broker;
pub mod client;
pub mod codec;
pub mod connection;
pub mod protocol;
pub mod service;

pub use broker::BrokerAdapter;
pub use client::BrokerClient;
pub use protocol::{BrokerRequest, BrokerResponse, Envelope, ResponseBody};
pub use service::BrokerService;

/// Adapter lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Created,
    Starting,
    /// Accepting connections.
    Running,
    ShuttingDown,
    Stopped,
    /// Bind failed.
    Failed,
}

/// Adapter health status.
#[derive(Debug, Clone)]
pub struct AdapterHealth {
    pub state: AdapterState,
    pub active_connections: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub last_error: Option<String>,
}

/// Lifecycle interface for protocol adapters.
pub trait Adapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn state(&self) -> AdapterState;

    fn health(&self) -> AdapterHealth;

    /// Bind and start accepting. Returns once listening.
    fn start(&self) -> Pin<Box<dyn Future<Output = CorralResult<()>> + Send + '_>>;

    /// Stop accepting and wait for the accept loop to exit.
    fn stop(&self) -> Pin<Box<dyn Future<Output = CorralResult<()>> + Send + '_>>;

    fn bind_addr(&self) -> SocketAddr;
}
