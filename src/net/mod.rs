//! Network plumbing.

pub mod tcp;

pub use tcp::{Accepted, ConnectionId, TcpConnection, TcpListener, TcpListenerConfig};
