//! Allocation commands: list, acquire, release, keepalive, guests.

use super::client::{format_tick, ClientOpts};
use crate::adapters::{BrokerRequest, ResponseBody};
use crate::alloc::{AcquireRequest, AllocationId, AllocationState, AllocationView};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};

/// List allocations.
#[derive(Args, Debug)]
pub struct AllocationsArgs {
    #[command(flatten)]
    pub client: ClientOpts,

    /// Aggregate across every federated server.
    #[arg(long)]
    pub federated: bool,
}

/// Request targets.
#[derive(Args, Debug)]
pub struct AcquireArgs {
    #[command(flatten)]
    pub client: ClientOpts,

    /// Target names.
    #[arg(required = true)]
    pub targets: Vec<String>,

    /// Priority; lower wins.
    #[arg(short, long)]
    pub priority: Option<u32>,

    /// Fail with Busy instead of queueing.
    #[arg(long)]
    pub no_queue: bool,

    /// Wait up to this many seconds for a queued allocation to be granted.
    #[arg(short, long)]
    pub wait: Option<u64>,
}

/// Refer to one allocation.
#[derive(Args, Debug)]
pub struct AllocationRefArgs {
    #[command(flatten)]
    pub client: ClientOpts,

    pub allocation_id: AllocationId,
}

/// Guest management.
#[derive(Args, Debug)]
pub struct GuestArgs {
    #[command(subcommand)]
    pub command: GuestCommand,
}

#[derive(Subcommand, Debug)]
pub enum GuestCommand {
    /// Admit a guest.
    Add {
        #[command(flatten)]
        client: ClientOpts,
        allocation_id: AllocationId,
        guest: String,
    },
    /// Remove a guest.
    Remove {
        #[command(flatten)]
        client: ClientOpts,
        allocation_id: AllocationId,
        guest: String,
    },
}

pub async fn run_allocations(args: AllocationsArgs) -> Result<()> {
    if args.federated {
        let body = args.client.call(BrokerRequest::FederatedListing).await?;
        if args.client.print_json(&body)? {
            return Ok(());
        }
        let view = body.federation.unwrap_or_default();
        println!("{:<12} {:<10} {:<10} {:<10}", "SERVER", "HEALTH", "FRESHNESS", "AGE");
        for status in &view.servers {
            println!(
                "{:<12} {:<10} {:<10} {:<10}",
                status.server,
                format!("{:?}", status.health).to_lowercase(),
                status
                    .freshness
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "-".into()),
                status
                    .age_ms
                    .map(|ms| format!("{}ms", ms))
                    .unwrap_or_else(|| "-".into()),
            );
            if let Some(error) = &status.error {
                println!("             {}", error);
            }
        }
        println!();
        print_header();
        for tagged in &view.allocations {
            print_row(&tagged.record);
        }
        return Ok(());
    }

    let body = args.client.call(BrokerRequest::ListAllocations).await?;
    if args.client.print_json(&body)? {
        return Ok(());
    }
    print_header();
    for allocation in body.allocations.unwrap_or_default() {
        print_row(&allocation);
    }
    Ok(())
}

pub async fn run_acquire(args: AcquireArgs) -> Result<()> {
    let mut request = AcquireRequest::new(args.targets);
    if let Some(priority) = args.priority {
        request = request.with_priority(priority);
    }
    if args.no_queue {
        request = request.no_queue();
    }

    let body = args.client.call(BrokerRequest::Acquire(request)).await?;
    let mut allocation = allocation_of(&body)?;

    if let (Some(secs), AllocationState::Queued) = (args.wait, allocation.state) {
        let body = args
            .client
            .call(BrokerRequest::Wait {
                allocation_id: allocation.id,
                timeout_ms: secs * 1000,
            })
            .await?;
        allocation = allocation_of(&body)?;
    }

    if args.client.json {
        println!("{}", serde_json::to_string_pretty(&allocation)?);
    } else {
        describe(&allocation);
    }
    if allocation.state == AllocationState::Queued && args.wait.is_some() {
        anyhow::bail!("allocation {} still queued", allocation.id);
    }
    Ok(())
}

pub async fn run_release(args: AllocationRefArgs) -> Result<()> {
    let body = args
        .client
        .call(BrokerRequest::Release {
            allocation_id: args.allocation_id,
        })
        .await?;
    finish(&args.client, &body)
}

pub async fn run_keepalive(args: AllocationRefArgs) -> Result<()> {
    let body = args
        .client
        .call(BrokerRequest::Keepalive {
            allocation_id: args.allocation_id,
        })
        .await?;
    finish(&args.client, &body)
}

pub async fn run_guest(args: GuestArgs) -> Result<()> {
    let (client, request) = match args.command {
        GuestCommand::Add {
            client,
            allocation_id,
            guest,
        } => (
            client,
            BrokerRequest::AddGuest {
                allocation_id,
                guest,
            },
        ),
        GuestCommand::Remove {
            client,
            allocation_id,
            guest,
        } => (
            client,
            BrokerRequest::RemoveGuest {
                allocation_id,
                guest,
            },
        ),
    };
    let body = client.call(request).await?;
    finish(&client, &body)
}

fn finish(client: &ClientOpts, body: &ResponseBody) -> Result<()> {
    if client.print_json(body)? {
        return Ok(());
    }
    describe(&allocation_of(body)?);
    Ok(())
}

fn allocation_of(body: &ResponseBody) -> Result<AllocationView> {
    body.allocation
        .clone()
        .context("response carries no allocation")
}

fn describe(a: &AllocationView) {
    println!("allocation {} is {}", a.id, a.state);
    println!("  user:     {}", a.user);
    println!("  priority: {}", a.priority);
    println!("  targets:  {}", a.targets.join(", "));
    if !a.granted.is_empty() {
        println!("  granted:  {}", a.granted.join(", "));
    }
    if !a.guests.is_empty() {
        println!("  guests:   {}", a.guests.join(", "));
    }
    if let Some(reason) = &a.reason {
        println!("  reason:   {}", reason);
    }
}

fn print_header() {
    println!(
        "{:<8} {:<10} {:<10} {:<12} {:<5} {:<20} {}",
        "ID", "STATE", "SERVER", "USER", "PRIO", "CREATED", "TARGETS"
    );
}

fn print_row(a: &AllocationView) {
    println!(
        "{:<8} {:<10} {:<10} {:<12} {:<5} {:<20} {}",
        a.id,
        a.state,
        a.server,
        a.user,
        a.priority,
        format_tick(a.created_at),
        a.targets.join(",")
    );
}
