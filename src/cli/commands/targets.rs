//! Targets command implementation.

use super::client::ClientOpts;
use crate::adapters::BrokerRequest;
use anyhow::Result;
use clap::Args;

/// List targets.
#[derive(Args, Debug)]
pub struct TargetsArgs {
    #[command(flatten)]
    pub client: ClientOpts,

    /// Only show targets nobody owns.
    #[arg(long)]
    pub available: bool,
}

pub async fn run_targets(args: TargetsArgs) -> Result<()> {
    let body = args.client.call(BrokerRequest::ListTargets).await?;
    if args.client.print_json(&body)? {
        return Ok(());
    }

    println!(
        "{:<20} {:<12} {:<16} {:<18} {}",
        "NAME", "TYPE", "IP", "MAC", "OWNER"
    );
    for target in body.targets.unwrap_or_default() {
        if args.available && !target.is_available() {
            continue;
        }
        println!(
            "{:<20} {:<12} {:<16} {:<18} {}",
            target.name,
            target.kind,
            target.ip.as_deref().unwrap_or("-"),
            target.mac.as_deref().unwrap_or("-"),
            target.owner_label()
        );
    }
    Ok(())
}
