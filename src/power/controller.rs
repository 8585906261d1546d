//! Power controller.
//!
//! Drives component power through a [`PowerDriver`] on behalf of users who
//! currently hold the target. Every affected component is marked
//! `transitioning` before the first driver call and only settles once the
//! driver confirms. A failed or timed-out step puts the component back to
//! its last confirmed stable state, and so does dropping the command future
//! before it completes.

use super::driver::PowerDriver;
use crate::alloc::{AllocationManager, Caller};
use crate::core::config::{PowerConfig, ALL_COMPONENTS};
use crate::core::error::{ComponentFailure, CorralError, CorralResult};
use crate::registry::{ComponentPower, PowerState, TargetCell, TargetRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Power command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerCommand {
    On,
    Off,
    /// Off, settle, on.
    Cycle,
}

impl std::fmt::Display for PowerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
            Self::Cycle => write!(f, "cycle"),
        }
    }
}

impl std::str::FromStr for PowerCommand {
    type Err = CorralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            "cycle" => Ok(Self::Cycle),
            other => Err(CorralError::invalid(format!(
                "unknown power command: {}",
                other
            ))),
        }
    }
}

/// Which components a command addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentSelector {
    One(String),
    All,
}

impl ComponentSelector {
    pub fn parse(name: &str) -> Self {
        if name == ALL_COMPONENTS {
            Self::All
        } else {
            Self::One(name.to_string())
        }
    }
}

impl std::fmt::Display for ComponentSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::One(name) => write!(f, "{}", name),
            Self::All => write!(f, "{}", ALL_COMPONENTS),
        }
    }
}

/// Result of a successful power command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerReport {
    pub target: String,
    pub command: PowerCommand,
    /// Final state of the addressed components, in declared order.
    pub components: Vec<ComponentPower>,
}

/// Executes power commands against targets.
pub struct PowerController {
    registry: Arc<TargetRegistry>,
    manager: Arc<AllocationManager>,
    driver: Arc<dyn PowerDriver>,
    command_timeout: Duration,
    cycle_settle: Duration,
    /// Serializes commands per target.
    locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl PowerController {
    pub fn new(
        manager: Arc<AllocationManager>,
        driver: Arc<dyn PowerDriver>,
        config: &PowerConfig,
    ) -> Self {
        let registry = Arc::clone(manager.registry());
        let locks = registry
            .names()
            .map(|name| (name.to_string(), Arc::new(tokio::sync::Mutex::new(()))))
            .collect();
        Self {
            registry,
            manager,
            driver,
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            cycle_settle: Duration::from_millis(config.cycle_settle_ms),
            locks,
        }
    }

    /// Power state of every component of a target, in declared order.
    pub fn get_power(&self, target: &str) -> CorralResult<Vec<ComponentPower>> {
        Ok(self.registry.cell(target)?.power_states())
    }

    /// Run a power command.
    ///
    /// Blocks until every addressed component settles or its step times out.
    /// The timeout applies per driver step, so a `cycle` of `all` on N
    /// components may take up to 2N step timeouts plus the settle delay.
    /// Commands addressing `all` report per-component failures as
    /// `PartialFailure`; single-component commands return the step's error.
    pub async fn set_power(
        &self,
        target: &str,
        selector: ComponentSelector,
        command: PowerCommand,
        caller: &Caller,
    ) -> CorralResult<PowerReport> {
        let cell = Arc::clone(self.registry.cell(target)?);
        let components = match &selector {
            ComponentSelector::All => cell.components(),
            ComponentSelector::One(name) => {
                if !cell.has_component(name) {
                    return Err(CorralError::ComponentNotFound {
                        target: target.to_string(),
                        component: name.clone(),
                    });
                }
                vec![name.clone()]
            }
        };

        self.manager.check_access(target, caller)?;

        let lock = self
            .locks
            .get(target)
            .cloned()
            .ok_or_else(|| CorralError::internal(format!("no command lock for {}", target)))?;
        let _serial = lock.lock().await;

        // The allocation may have ended while this command waited its turn.
        let allocation_id = self.manager.check_access(target, caller)?;

        tracing::info!(
            target_name = %target,
            component = %selector,
            command = %command,
            allocation_id = %allocation_id,
            user = %caller.user,
            driver = self.driver.name(),
            "power command started"
        );

        let mut transition = Transition::begin(Arc::clone(&cell), &components);

        let mut failures = Vec::new();
        match command {
            PowerCommand::On => {
                self.run_phase(&mut transition, &components, PowerState::On, true, &mut failures)
                    .await
            }
            PowerCommand::Off => {
                let reversed: Vec<String> = components.iter().rev().cloned().collect();
                self.run_phase(&mut transition, &reversed, PowerState::Off, true, &mut failures)
                    .await
            }
            PowerCommand::Cycle => {
                let reversed: Vec<String> = components.iter().rev().cloned().collect();
                self.run_phase(&mut transition, &reversed, PowerState::Off, false, &mut failures)
                    .await;
                tokio::time::sleep(self.cycle_settle).await;
                let survivors: Vec<String> = components
                    .iter()
                    .filter(|c| !failures.iter().any(|(name, _)| name == *c))
                    .cloned()
                    .collect();
                self.run_phase(&mut transition, &survivors, PowerState::On, true, &mut failures)
                    .await
            }
        }
        drop(transition);

        if failures.is_empty() {
            tracing::info!(target_name = %target, command = %command, "power command complete");
            return Ok(self.report(&cell, &components, command));
        }

        for (component, error) in &failures {
            tracing::warn!(
                target_name = %target,
                component = %component,
                command = %command,
                error = %error,
                "power step failed"
            );
        }

        match selector {
            ComponentSelector::One(_) => {
                let (_, error) = failures.remove(0);
                Err(error)
            }
            ComponentSelector::All => {
                let succeeded = components
                    .iter()
                    .filter(|c| !failures.iter().any(|(name, _)| name == *c))
                    .cloned()
                    .collect();
                Err(CorralError::PartialFailure {
                    target: target.to_string(),
                    succeeded,
                    failures: failures
                        .into_iter()
                        .map(|(component, error)| ComponentFailure {
                            component,
                            reason: error.to_string(),
                        })
                        .collect(),
                })
            }
        }
    }

    /// Switch each component in order. Successful components settle at
    /// `state` when `settle` is set; failed ones revert to their last
    /// confirmed state.
    async fn run_phase(
        &self,
        transition: &mut Transition,
        components: &[String],
        state: PowerState,
        settle: bool,
        failures: &mut Vec<(String, CorralError)>,
    ) {
        let target = transition.cell.name().to_string();
        for component in components {
            match self.step(&target, component, state).await {
                Ok(()) => transition.confirm(component, state, settle),
                Err(error) => {
                    transition.revert(component);
                    failures.push((component.clone(), error));
                }
            }
        }
    }

    async fn step(&self, target: &str, component: &str, state: PowerState) -> CorralResult<()> {
        match tokio::time::timeout(
            self.command_timeout,
            self.driver.switch(target, component, state),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CorralError::timeout(format!(
                "switching {}/{} {} took longer than {}ms",
                target,
                component,
                state,
                self.command_timeout.as_millis()
            ))),
        }
    }

    fn report(&self, cell: &TargetCell, components: &[String], command: PowerCommand) -> PowerReport {
        PowerReport {
            target: cell.name().to_string(),
            command,
            components: cell
                .power_states()
                .into_iter()
                .filter(|c| components.contains(&c.component))
                .collect(),
        }
    }
}

/// Components of one command that are `transitioning`.
///
/// Tracks the last state the driver confirmed for each of them. Anything
/// still in flight when this is dropped, including by a cancelled caller,
/// goes back to that state.
struct Transition {
    cell: Arc<TargetCell>,
    confirmed: HashMap<String, PowerState>,
    pending: Vec<String>,
}

impl Transition {
    fn begin(cell: Arc<TargetCell>, components: &[String]) -> Self {
        let confirmed = cell
            .power_states()
            .into_iter()
            .filter(|c| components.contains(&c.component))
            .map(|c| {
                let state = Some(c.state)
                    .filter(PowerState::is_stable)
                    .unwrap_or(PowerState::Off);
                (c.component, state)
            })
            .collect();
        cell.set_power_states(components, PowerState::Transitioning);
        Self {
            cell,
            confirmed,
            pending: components.to_vec(),
        }
    }

    /// The driver reached `state`. Publish it now if `settle`, otherwise keep
    /// the component transitioning for a later phase.
    fn confirm(&mut self, component: &str, state: PowerState, settle: bool) {
        self.confirmed.insert(component.to_string(), state);
        if settle {
            self.cell.set_power_state(component, state);
            self.pending.retain(|c| c != component);
        }
    }

    fn revert(&mut self, component: &str) {
        let state = self.last_confirmed(component);
        self.cell.set_power_state(component, state);
        self.pending.retain(|c| c != component);
    }

    fn last_confirmed(&self, component: &str) -> PowerState {
        self.confirmed
            .get(component)
            .copied()
            .unwrap_or(PowerState::Off)
    }
}

impl Drop for Transition {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        tracing::warn!(
            target_name = %self.cell.name(),
            components = ?self.pending,
            "power command abandoned, restoring last confirmed state"
        );
        for component in std::mem::take(&mut self.pending) {
            let state = self.last_confirmed(&component);
            self.cell.set_power_state(&component, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parsing() {
        assert_eq!("cycle".parse::<PowerCommand>().unwrap(), PowerCommand::Cycle);
        assert!("reboot".parse::<PowerCommand>().is_err());
        assert_eq!(
            serde_json::to_string(&PowerCommand::Off).unwrap(),
            "\"off\""
        );
    }

    #[test]
    fn selector_parsing() {
        assert_eq!(ComponentSelector::parse("all"), ComponentSelector::All);
        assert_eq!(
            ComponentSelector::parse("usb"),
            ComponentSelector::One("usb".into())
        );
        assert_eq!(ComponentSelector::All.to_string(), "all");
    }
}
