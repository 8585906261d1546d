//! Configuration parsing and validation.
//!
//! Corral configuration is loaded from TOML files with CLI overrides.
//! The target inventory is provisioned through `[[targets]]` entries.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

/// Reserved component selector meaning "every component".
pub const ALL_COMPONENTS: &str = "all";

/// Top-level corral configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// This broker server.
    pub server: ServerConfig,

    /// Allocation policy.
    #[serde(default)]
    pub allocation: AllocationConfig,

    /// Power control settings.
    #[serde(default)]
    pub power: PowerConfig,

    /// Remote brokers to aggregate.
    #[serde(default)]
    pub federation: FederationConfig,

    /// Logging configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Administrative users.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Target inventory.
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

/// Broker server identity and listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server identity used to tag federated records.
    pub id: String,

    /// Bind address for the wire adapter (e.g., "0.0.0.0:7420").
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Maximum concurrent client connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Idle connection timeout in milliseconds.
    #[serde(default = "default_connection_idle_timeout_ms")]
    pub connection_idle_timeout_ms: u64,
}

/// Allocation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    /// Largest accepted priority value (lower values win).
    #[serde(default = "default_max_priority")]
    pub max_priority: u32,

    /// Priority used when a request does not name one.
    #[serde(default = "default_priority")]
    pub default_priority: u32,

    /// Maximum time a request may stay queued, in milliseconds.
    #[serde(default = "default_queue_max_wait_ms")]
    pub queue_max_wait_ms: u64,

    /// Maximum time an active allocation may go without keepalive, in milliseconds.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// How long terminal allocations remain observable, in milliseconds.
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,

    /// Timeout sweep period in milliseconds.
    #[serde(default = "default_sweep_period_ms")]
    pub sweep_period_ms: u64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            max_priority: default_max_priority(),
            default_priority: default_priority(),
            queue_max_wait_ms: default_queue_max_wait_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            retention_ms: default_retention_ms(),
            sweep_period_ms: default_sweep_period_ms(),
        }
    }
}

/// Power control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerConfig {
    /// Driver: only "simulated" ships with corral.
    #[serde(default = "default_power_driver")]
    pub driver: String,

    /// Deadline for a single driver step, in milliseconds. Commands touching
    /// several components (or cycling) run one step per component and phase,
    /// each with its own deadline; there is no overall command deadline.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Settle delay between the off and on halves of a cycle, in milliseconds.
    #[serde(default = "default_cycle_settle_ms")]
    pub cycle_settle_ms: u64,

    /// Latency of the simulated driver, in milliseconds.
    #[serde(default = "default_simulated_latency_ms")]
    pub simulated_latency_ms: u64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            driver: default_power_driver(),
            command_timeout_ms: default_command_timeout_ms(),
            cycle_settle_ms: default_cycle_settle_ms(),
            simulated_latency_ms: default_simulated_latency_ms(),
        }
    }
}

/// Federation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// Background poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Per-server request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Listing cache TTL in seconds.
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,

    /// Grace period past TTL during which stale listings are still shown.
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,

    /// Remote broker servers.
    #[serde(default)]
    pub remotes: Vec<RemoteServerConfig>,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
            grace_seconds: default_grace_seconds(),
            remotes: Vec::new(),
        }
    }
}

/// A remote broker server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteServerConfig {
    /// Server identity.
    pub id: String,
    /// Wire adapter address (host:port).
    pub address: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Administrative users.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Users allowed to release any allocation.
    #[serde(default)]
    pub admins: Vec<String>,
}

/// A target inventory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Unique target name.
    pub name: String,

    /// Type tag (e.g., "qemu-x86", "nuc").
    #[serde(rename = "type", default = "default_target_type")]
    pub kind: String,

    /// IP address (display only).
    #[serde(default)]
    pub ip: Option<String>,

    /// MAC address (display only).
    #[serde(default)]
    pub mac: Option<String>,

    /// Power components in power-on order.
    #[serde(default = "default_components")]
    pub components: Vec<String>,
}

// Default value functions

fn default_bind() -> String {
    "127.0.0.1:7420".to_string()
}

fn default_max_connections() -> usize {
    1_024
}

fn default_connection_idle_timeout_ms() -> u64 {
    300_000
}

fn default_max_priority() -> u32 {
    1_000
}

fn default_priority() -> u32 {
    500
}

fn default_queue_max_wait_ms() -> u64 {
    3_600_000
}

fn default_idle_timeout_ms() -> u64 {
    600_000
}

fn default_retention_ms() -> u64 {
    300_000
}

fn default_sweep_period_ms() -> u64 {
    1_000
}

fn default_power_driver() -> String {
    "simulated".to_string()
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_cycle_settle_ms() -> u64 {
    2_000
}

fn default_simulated_latency_ms() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    2_000
}

fn default_cache_ttl_seconds() -> u64 {
    10
}

fn default_grace_seconds() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_target_type() -> String {
    "generic".to_string()
}

fn default_components() -> Vec<String> {
    vec!["main".to_string()]
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref bind) = overrides.bind {
            self.server.bind = bind.clone();
        }
    }

    /// Parsed bind address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .with_context(|| format!("invalid server.bind address: {}", self.server.bind))
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_server()?;
        self.validate_allocation()?;
        self.validate_power()?;
        self.validate_federation()?;
        self.validate_telemetry()?;
        self.validate_targets()?;
        Ok(())
    }

    fn validate_server(&self) -> Result<()> {
        if self.server.id.trim().is_empty() {
            anyhow::bail!("server.id must not be empty");
        }
        self.bind_addr()?;
        if self.server.max_connections == 0 {
            anyhow::bail!("server.max_connections must be > 0");
        }
        Ok(())
    }

    fn validate_allocation(&self) -> Result<()> {
        let a = &self.allocation;
        if a.default_priority > a.max_priority {
            anyhow::bail!(
                "allocation.default_priority ({}) cannot exceed allocation.max_priority ({})",
                a.default_priority,
                a.max_priority
            );
        }
        if a.queue_max_wait_ms == 0 {
            anyhow::bail!("allocation.queue_max_wait_ms must be > 0");
        }
        if a.idle_timeout_ms == 0 {
            anyhow::bail!("allocation.idle_timeout_ms must be > 0");
        }
        if a.sweep_period_ms == 0 {
            anyhow::bail!("allocation.sweep_period_ms must be > 0");
        }
        Ok(())
    }

    fn validate_power(&self) -> Result<()> {
        if self.power.driver != "simulated" {
            anyhow::bail!(
                "power.driver must be 'simulated', got: {}",
                self.power.driver
            );
        }
        if self.power.command_timeout_ms == 0 {
            anyhow::bail!("power.command_timeout_ms must be > 0");
        }
        Ok(())
    }

    fn validate_federation(&self) -> Result<()> {
        let f = &self.federation;
        if f.poll_interval_ms == 0 {
            anyhow::bail!("federation.poll_interval_ms must be > 0");
        }
        if f.request_timeout_ms == 0 {
            anyhow::bail!("federation.request_timeout_ms must be > 0");
        }
        if f.cache_ttl_seconds == 0 {
            anyhow::bail!("federation.cache_ttl_seconds must be > 0");
        }

        let mut seen = HashSet::new();
        seen.insert(self.server.id.as_str());
        for remote in &f.remotes {
            if !seen.insert(remote.id.as_str()) {
                anyhow::bail!("federation remote id '{}' is not unique", remote.id);
            }
            if remote.address.trim().is_empty() {
                anyhow::bail!("federation remote '{}' has an empty address", remote.id);
            }
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }

    fn validate_targets(&self) -> Result<()> {
        let mut names = HashSet::new();
        for target in &self.targets {
            if target.name.trim().is_empty() {
                anyhow::bail!("target name must not be empty");
            }
            if !names.insert(target.name.as_str()) {
                anyhow::bail!("duplicate target name: {}", target.name);
            }
            if target.components.is_empty() {
                anyhow::bail!("target {} must declare at least one component", target.name);
            }
            let mut components = HashSet::new();
            for component in &target.components {
                if component == ALL_COMPONENTS {
                    anyhow::bail!(
                        "target {}: component name '{}' is reserved",
                        target.name,
                        ALL_COMPONENTS
                    );
                }
                if !components.insert(component.as_str()) {
                    anyhow::bail!(
                        "target {}: duplicate component {}",
                        target.name,
                        component
                    );
                }
            }
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override server bind address.
    pub bind: Option<String>,
}
