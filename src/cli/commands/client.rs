//! Shared client plumbing for commands that talk to a running broker.

use crate::adapters::{BrokerClient, BrokerRequest, ResponseBody};
use crate::core::time::Tick;
use anyhow::{Context, Result};
use clap::Args;
use std::time::Duration;

/// Connection options shared by client commands.
#[derive(Args, Debug, Clone)]
pub struct ClientOpts {
    /// Broker address.
    #[arg(short, long, env = "CORRAL_ENDPOINT", default_value = "127.0.0.1:7420")]
    pub endpoint: String,

    /// User to act as (defaults to $USER).
    #[arg(short, long, env = "CORRAL_USER")]
    pub user: Option<String>,

    /// Federated server that should execute the request. The endpoint
    /// forwards it there.
    #[arg(long, env = "CORRAL_SERVER")]
    pub server: Option<String>,

    /// Connect timeout in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// Print raw JSON instead of tables.
    #[arg(long)]
    pub json: bool,
}

impl ClientOpts {
    pub fn user(&self) -> Result<String> {
        match &self.user {
            Some(user) => Ok(user.clone()),
            None => std::env::var("USER").context("no --user given and $USER is not set"),
        }
    }

    /// Send one request and return the response body.
    pub async fn call(&self, request: BrokerRequest) -> Result<ResponseBody> {
        let user = self.user()?;
        let mut client = BrokerClient::connect(
            &self.endpoint,
            &user,
            Duration::from_millis(self.connect_timeout_ms),
        )
        .await?;
        if let Some(server) = &self.server {
            client = client.route_to(server.clone());
        }
        let op = request.op();
        let body = client
            .call(request)
            .await
            .with_context(|| format!("{} failed", op))?;
        Ok(body)
    }

    /// Print a body as JSON when `--json` was given. Returns whether it did.
    pub fn print_json(&self, body: &ResponseBody) -> Result<bool> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(body)?);
        }
        Ok(self.json)
    }
}

/// Render a tick as a UTC timestamp.
pub fn format_tick(tick: Tick) -> String {
    chrono::DateTime::from_timestamp_millis(tick.ms as i64)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| tick.to_string())
}
