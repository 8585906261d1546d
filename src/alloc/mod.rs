//! Allocation management.
//!
//! Allocations reserve sets of targets for a user. Requests that cannot be
//! satisfied wait in per-target priority queues; a request is granted only
//! when it heads the queue of every target it asks for and all of them are
//! free, then every target is claimed in one ownership batch.

pub mod allocation;
pub mod manager;
mod queue;
pub mod sweep;

pub use allocation::{AcquireRequest, AllocationId, AllocationState, AllocationView, Caller};
pub use manager::{AllocationManager, AllocationStats};
pub use sweep::{spawn_sweeper, SweepReport};
