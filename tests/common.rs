//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use corral::alloc::{AcquireRequest, AllocationManager, AllocationView, Caller};
use corral::core::config::{AllocationConfig, Config, PowerConfig, TargetConfig};
use corral::core::time::{ManualClock, Tick};
use corral::power::{PowerController, SimulatedDriver};
use corral::registry::TargetRegistry;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Server id used by single-server fixtures.
pub const SERVER: &str = "lab-a";

/// Inventory entry with the given components.
pub fn target(name: &str, components: &[&str]) -> TargetConfig {
    TargetConfig {
        name: name.to_string(),
        kind: "qemu-x86".to_string(),
        ip: None,
        mac: None,
        components: components.iter().map(|c| c.to_string()).collect(),
    }
}

/// Registry with single-component targets.
pub fn registry(names: &[&str]) -> Arc<TargetRegistry> {
    let targets: Vec<TargetConfig> = names.iter().map(|n| target(n, &["main"])).collect();
    Arc::new(TargetRegistry::new(&targets).expect("registry"))
}

/// Allocation policy with short, easy to reason about timeouts.
pub fn allocation_config() -> AllocationConfig {
    AllocationConfig {
        max_priority: 100,
        default_priority: 50,
        queue_max_wait_ms: 60_000,
        idle_timeout_ms: 30_000,
        retention_ms: 10_000,
        sweep_period_ms: 1_000,
    }
}

/// Manager over `names` driven by a manual clock starting at 1s.
pub fn manager(names: &[&str]) -> (Arc<AllocationManager>, Arc<ManualClock>) {
    manager_for(registry(names))
}

/// Manager over an existing registry.
pub fn manager_for(registry: Arc<TargetRegistry>) -> (Arc<AllocationManager>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Tick::new(1_000)));
    let manager = Arc::new(AllocationManager::new(
        SERVER,
        registry,
        clock.clone(),
        allocation_config(),
    ));
    (manager, clock)
}

/// Acquire with default priority, panicking on error.
pub fn acquire(manager: &AllocationManager, user: &str, targets: &[&str]) -> AllocationView {
    manager
        .acquire(&Caller::user(user), AcquireRequest::new(targets.iter().copied()))
        .expect("acquire")
}

/// Acquire with an explicit priority, panicking on error.
pub fn acquire_with(
    manager: &AllocationManager,
    user: &str,
    targets: &[&str],
    priority: u32,
) -> AllocationView {
    manager
        .acquire(
            &Caller::user(user),
            AcquireRequest::new(targets.iter().copied()).with_priority(priority),
        )
        .expect("acquire")
}

/// Power fixture: a manager plus a controller over a simulated driver.
pub struct PowerFixture {
    pub manager: Arc<AllocationManager>,
    pub driver: Arc<SimulatedDriver>,
    pub controller: Arc<PowerController>,
}

/// Power fixture with one target `nuc-01` whose components are `psu`, `main`.
pub fn power_fixture(latency_ms: u64, command_timeout_ms: u64, settle_ms: u64) -> PowerFixture {
    let registry = Arc::new(TargetRegistry::new(&[target("nuc-01", &["psu", "main"])]).expect("registry"));
    let (manager, _) = manager_for(registry);
    let driver = Arc::new(SimulatedDriver::new(Duration::from_millis(latency_ms)));
    let controller = Arc::new(PowerController::new(
        manager.clone(),
        driver.clone(),
        &PowerConfig {
            driver: "simulated".to_string(),
            command_timeout_ms,
            cycle_settle_ms: settle_ms,
            simulated_latency_ms: latency_ms,
        },
    ));
    PowerFixture {
        manager,
        driver,
        controller,
    }
}

/// Config for a runtime bound to an ephemeral local port.
pub fn runtime_config(server_id: &str, remotes: &[(&str, &str)]) -> Config {
    let mut content = format!(
        r#"
[server]
id = "{}"
bind = "127.0.0.1:0"

[allocation]
queue_max_wait_ms = 60000

[power]
simulated_latency_ms = 1
cycle_settle_ms = 1

[federation]
poll_interval_ms = 50
request_timeout_ms = 500

[auth]
admins = ["root"]

[[targets]]
name = "qemu-01"

[[targets]]
name = "qemu-02"

[[targets]]
name = "nuc-01"
components = ["psu", "main"]
"#,
        server_id
    );
    for (id, address) in remotes {
        content.push_str(&format!(
            "\n[[federation.remotes]]\nid = \"{}\"\naddress = \"{}\"\n",
            id, address
        ));
    }
    Config::from_toml(&content).expect("runtime config")
}

/// Write a configuration file to a temp path.
pub fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}
