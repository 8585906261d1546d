//! Command-line interface.
//!
//! One binary runs the broker (`corral start`) and talks to it (every other
//! subcommand).

pub mod commands;

use clap::{Parser, Subcommand};

/// Corral - lab target allocation broker.
#[derive(Parser, Debug)]
#[command(name = "corral")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the broker server.
    Start(commands::StartArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
    /// List targets and their owners.
    Targets(commands::TargetsArgs),
    /// List allocations.
    Allocations(commands::AllocationsArgs),
    /// Request one or more targets.
    Acquire(commands::AcquireArgs),
    /// Release (or withdraw) an allocation.
    Release(commands::AllocationRefArgs),
    /// Refresh an allocation's keepalive.
    Keepalive(commands::AllocationRefArgs),
    /// Manage allocation guests.
    Guest(commands::GuestArgs),
    /// Switch target power.
    Power(commands::PowerArgs),
    /// Show target power state.
    PowerStatus(commands::PowerStatusArgs),
}
