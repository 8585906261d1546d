//! CLI command implementations.

mod allocations;
mod client;
mod config;
mod power;
mod start;
mod targets;

pub use allocations::{
    run_acquire, run_allocations, run_guest, run_keepalive, run_release, AcquireArgs,
    AllocationRefArgs, AllocationsArgs, GuestArgs, GuestCommand,
};
pub use client::ClientOpts;
pub use config::{run_config, ConfigArgs, ConfigCommand};
pub use power::{run_power, run_power_status, PowerArgs, PowerStatusArgs};
pub use start::{run_start, StartArgs};
pub use targets::{run_targets, TargetsArgs};
