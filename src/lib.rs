//! Corral - lab target allocation broker.
//!
//! Corral arbitrates exclusive access to a shared pool of lab targets
//! (machines, emulators, boards). Users acquire sets of targets, queue when
//! they are busy, keep their allocations alive, share them with guests and
//! switch target power. Several broker servers can be aggregated into one
//! federated view.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 CLI  │  JSON-lines wire clients                 │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Broker Adapter (wire)                        │
//! │          framing, identity, request dispatch, errors            │
//! └─────────────────────────────────────────────────────────────────┘
//!            │                     │                     │
//! ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────────┐
//! │ Allocation Mgr   │  │ Power Controller │  │ Federation Gateway   │
//! │ queues, timeouts │  │ drivers, cycles  │  │ fan-out, freshness   │
//! └──────────────────┘  └──────────────────┘  └──────────────────────┘
//!            │                     │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Target Registry                           │
//! │           owner cells (CAS) │ component power state             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Main runtime orchestration
//! - [`core::time`] - Clock abstraction
//! - [`core::error`] - Error types and wire kinds
//!
//! ## Domain
//! - [`registry`] - Target inventory and ownership cells
//! - [`alloc`] - Allocation lifecycle, queues and timeout sweep
//! - [`power`] - Power drivers and the per-target command serializer
//! - [`federation`] - Multi-server aggregation with cached listings
//!
//! ## Wire
//! - [`adapters`] - JSON-lines protocol, codec, service and client
//! - [`net`] - TCP listener with connection limits
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - A target has at most one owner, and owners change only by compare-and-set
//! - A grant claims every requested target or none of them
//! - Queued requests are served by priority, then arrival order
//! - Power commands on one target never overlap

// Core infrastructure
pub mod core;

// Domain
pub mod registry;
pub mod alloc;
pub mod power;
pub mod federation;

// Wire protocol
pub mod adapters;

// Networking
pub mod net;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime, time};
pub use self::core::error::{CorralError, CorralResult};
