//! Power drivers.
//!
//! A driver performs the physical side effect of switching one component of
//! one target. The controller owns sequencing, timeouts and state tracking;
//! drivers only report whether the switch happened.

use crate::core::error::{CorralError, CorralResult};
use crate::registry::PowerState;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Future returned by driver operations.
pub type DriverFuture<'a> = Pin<Box<dyn Future<Output = CorralResult<()>> + Send + 'a>>;

/// Hardware abstraction for power switching.
pub trait PowerDriver: Send + Sync {
    /// Switch a component to `state` (`On` or `Off`).
    fn switch<'a>(&'a self, target: &'a str, component: &'a str, state: PowerState)
        -> DriverFuture<'a>;

    /// Driver name for logs.
    fn name(&self) -> &'static str;
}

/// Build the driver named in configuration.
pub fn driver_for(name: &str, latency: Duration) -> CorralResult<std::sync::Arc<dyn PowerDriver>> {
    match name {
        "simulated" => Ok(std::sync::Arc::new(SimulatedDriver::new(latency))),
        other => Err(CorralError::invalid(format!(
            "unknown power driver: {}",
            other
        ))),
    }
}

/// In-memory driver that sleeps a fixed latency per switch.
///
/// Components can be told to fail or to hang forever, and every completed
/// switch is journaled in order.
#[derive(Debug, Default)]
pub struct SimulatedDriver {
    latency: Duration,
    failing: Mutex<HashSet<(String, String)>>,
    hanging: Mutex<HashSet<(String, String)>>,
    journal: Mutex<Vec<(String, String, PowerState)>>,
}

impl SimulatedDriver {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Make every switch of this component fail.
    pub fn fail(&self, target: &str, component: &str) {
        self.failing
            .lock()
            .insert((target.to_string(), component.to_string()));
    }

    /// Make every switch of this component never complete.
    pub fn hang(&self, target: &str, component: &str) {
        self.hanging
            .lock()
            .insert((target.to_string(), component.to_string()));
    }

    /// Clear injected faults.
    pub fn heal(&self) {
        self.failing.lock().clear();
        self.hanging.lock().clear();
    }

    /// Completed switches, oldest first.
    pub fn journal(&self) -> Vec<(String, String, PowerState)> {
        self.journal.lock().clone()
    }
}

impl PowerDriver for SimulatedDriver {
    fn switch<'a>(
        &'a self,
        target: &'a str,
        component: &'a str,
        state: PowerState,
    ) -> DriverFuture<'a> {
        Box::pin(async move {
            let key = (target.to_string(), component.to_string());
            if self.hanging.lock().contains(&key) {
                std::future::pending::<()>().await;
            }
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            if self.failing.lock().contains(&key) {
                return Err(CorralError::internal(format!(
                    "simulated fault switching {}/{} {}",
                    target, component, state
                )));
            }
            self.journal.lock().push((key.0, key.1, state));
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}
