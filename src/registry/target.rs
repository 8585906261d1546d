//! Target records.
//!
//! A [`TargetCell`] holds the static attributes of one target, its owner
//! reference as an atomic cell (0 means available), and the power state of
//! each declared component.

use crate::alloc::AllocationId;
use crate::core::config::TargetConfig;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Power state of a single component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Off,
    On,
    /// A command is in flight.
    Transitioning,
}

impl PowerState {
    /// Stable states are the ones a driver can confirm.
    pub fn is_stable(&self) -> bool {
        !matches!(self, Self::Transitioning)
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::On => write!(f, "on"),
            Self::Transitioning => write!(f, "transitioning"),
        }
    }
}

/// Power state of a named component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentPower {
    pub component: String,
    pub state: PowerState,
}

/// Static target attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub ip: Option<String>,
    pub mac: Option<String>,
}

/// Listing record for a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetView {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub ip: Option<String>,
    pub mac: Option<String>,
    /// Owning allocation, `None` when available.
    pub owner: Option<AllocationId>,
}

impl TargetView {
    /// Owner column as shown to users.
    pub fn owner_label(&self) -> String {
        match self.owner {
            Some(id) => id.to_string(),
            None => "available".to_string(),
        }
    }

    /// Whether nobody owns the target.
    pub fn is_available(&self) -> bool {
        self.owner.is_none()
    }
}

/// Registry slot for one target.
#[derive(Debug)]
pub struct TargetCell {
    info: TargetInfo,
    owner: AtomicU64,
    power: RwLock<Vec<ComponentPower>>,
}

impl TargetCell {
    /// Build a cell from an inventory entry. Components start powered off.
    pub fn from_config(config: &TargetConfig) -> Self {
        let power = config
            .components
            .iter()
            .map(|c| ComponentPower {
                component: c.clone(),
                state: PowerState::Off,
            })
            .collect();
        Self {
            info: TargetInfo {
                name: config.name.clone(),
                kind: config.kind.clone(),
                ip: config.ip.clone(),
                mac: config.mac.clone(),
            },
            owner: AtomicU64::new(0),
            power: RwLock::new(power),
        }
    }

    /// Static attributes.
    pub fn info(&self) -> &TargetInfo {
        &self.info
    }

    /// Target name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Current owner.
    pub fn owner(&self) -> Option<AllocationId> {
        AllocationId::from_raw(self.owner.load(Ordering::Acquire))
    }

    /// Compare-and-set the owner. On failure returns the actual owner.
    pub(crate) fn compare_and_set_owner(
        &self,
        expected: Option<AllocationId>,
        new: Option<AllocationId>,
    ) -> Result<(), Option<AllocationId>> {
        self.owner
            .compare_exchange(
                AllocationId::to_raw(expected),
                AllocationId::to_raw(new),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(AllocationId::from_raw)
    }

    /// Snapshot for listings.
    pub fn view(&self) -> TargetView {
        TargetView {
            name: self.info.name.clone(),
            kind: self.info.kind.clone(),
            ip: self.info.ip.clone(),
            mac: self.info.mac.clone(),
            owner: self.owner(),
        }
    }

    /// Component names in declared (power-on) order.
    pub fn components(&self) -> Vec<String> {
        self.power.read().iter().map(|c| c.component.clone()).collect()
    }

    /// Whether the component is declared.
    pub fn has_component(&self, component: &str) -> bool {
        self.power.read().iter().any(|c| c.component == component)
    }

    /// Power state of every component in declared order.
    pub fn power_states(&self) -> Vec<ComponentPower> {
        self.power.read().clone()
    }

    /// Power state of one component.
    pub fn power_state(&self, component: &str) -> Option<PowerState> {
        self.power
            .read()
            .iter()
            .find(|c| c.component == component)
            .map(|c| c.state)
    }

    /// Set the power state of several components under one write lock.
    pub(crate) fn set_power_states(&self, components: &[String], state: PowerState) {
        let mut power = self.power.write();
        for slot in power.iter_mut() {
            if components.iter().any(|c| *c == slot.component) {
                slot.state = state;
            }
        }
    }

    /// Set the power state of one component.
    pub(crate) fn set_power_state(&self, component: &str, state: PowerState) {
        let mut power = self.power.write();
        if let Some(slot) = power.iter_mut().find(|c| c.component == component) {
            slot.state = state;
        }
    }
}
