//! Power commands.

use super::client::ClientOpts;
use crate::adapters::BrokerRequest;
use crate::core::config::ALL_COMPONENTS;
use crate::power::PowerCommand;
use crate::registry::ComponentPower;
use anyhow::{Context, Result};
use clap::Args;

/// Switch power.
#[derive(Args, Debug)]
pub struct PowerArgs {
    #[command(flatten)]
    pub client: ClientOpts,

    pub target: String,

    /// on, off or cycle.
    pub command: String,

    /// Component name, or "all".
    #[arg(long, default_value = ALL_COMPONENTS)]
    pub component: String,
}

/// Show power state.
#[derive(Args, Debug)]
pub struct PowerStatusArgs {
    #[command(flatten)]
    pub client: ClientOpts,

    pub target: String,
}

pub async fn run_power(args: PowerArgs) -> Result<()> {
    let command: PowerCommand = args.command.parse()?;
    let body = args
        .client
        .call(BrokerRequest::Power {
            target: args.target,
            component: args.component,
            command,
        })
        .await?;
    if args.client.print_json(&body)? {
        return Ok(());
    }
    let report = body.power.context("response carries no power report")?;
    println!("{} {}: done", report.target, report.command);
    print_components(&report.components);
    Ok(())
}

pub async fn run_power_status(args: PowerStatusArgs) -> Result<()> {
    let body = args
        .client
        .call(BrokerRequest::GetPower {
            target: args.target.clone(),
        })
        .await?;
    if args.client.print_json(&body)? {
        return Ok(());
    }
    println!("{}:", args.target);
    print_components(&body.components.unwrap_or_default());
    Ok(())
}

fn print_components(components: &[ComponentPower]) {
    for c in components {
        println!("  {:<16} {}", c.component, c.state);
    }
}
