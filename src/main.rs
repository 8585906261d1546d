//! Corral - unified CLI entrypoint.
//!
//! Usage:
//!   corral start --config config/corral.toml
//!   corral config validate --config config/corral.toml
//!   corral targets [--endpoint ADDR] [--user NAME]
//!   corral acquire qemu-01 qemu-02 --priority 10 --wait 60
//!   corral power qemu-01 cycle
//!   corral release 7

use anyhow::Result;
use clap::Parser;
use corral::cli::commands::{
    run_acquire, run_allocations, run_config, run_guest, run_keepalive, run_power,
    run_power_status, run_release, run_start, run_targets,
};
use corral::cli::{Cli, Commands};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/corral.toml"));

    match cli.command {
        Commands::Start(args) => run_start(&config_path, cli.log_level, args).await,
        Commands::Config(args) => run_config(&config_path, args),
        Commands::Targets(args) => run_targets(args).await,
        Commands::Allocations(args) => run_allocations(args).await,
        Commands::Acquire(args) => run_acquire(args).await,
        Commands::Release(args) => run_release(args).await,
        Commands::Keepalive(args) => run_keepalive(args).await,
        Commands::Guest(args) => run_guest(args).await,
        Commands::Power(args) => run_power(args).await,
        Commands::PowerStatus(args) => run_power_status(args).await,
    }
}
