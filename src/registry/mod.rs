//! Target registry.
//!
//! Holds the canonical set of targets. Ownership is stored per target in an
//! atomic cell and changed only by compare-and-set. Multi-target changes run
//! inside an [`OwnershipBatch`], which brackets the writes with a generation
//! counter: [`TargetRegistry::list`] reads without locking and retries when a
//! batch overlapped, so a listing never shows a half-applied grant or release.

pub mod target;

pub use target::{ComponentPower, PowerState, TargetCell, TargetInfo, TargetView};

use crate::alloc::AllocationId;
use crate::core::config::TargetConfig;
use crate::core::error::{CorralError, CorralResult};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

/// The canonical target set.
#[derive(Debug)]
pub struct TargetRegistry {
    /// Targets by name. Fixed after construction; BTreeMap gives stable order.
    targets: BTreeMap<String, Arc<TargetCell>>,

    /// Odd while an ownership batch is being applied.
    generation: AtomicU64,

    /// Serializes ownership batches.
    batch_lock: Mutex<()>,
}

impl TargetRegistry {
    /// Build a registry from inventory entries.
    pub fn new(targets: &[TargetConfig]) -> CorralResult<Self> {
        let mut map = BTreeMap::new();
        for config in targets {
            let cell = Arc::new(TargetCell::from_config(config));
            if map.insert(config.name.clone(), cell).is_some() {
                return Err(CorralError::invalid(format!(
                    "duplicate target name: {}",
                    config.name
                )));
            }
        }
        tracing::debug!(targets = map.len(), "target registry loaded");
        Ok(Self {
            targets: map,
            generation: AtomicU64::new(0),
            batch_lock: Mutex::new(()),
        })
    }

    /// Number of targets.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Whether a target exists.
    pub fn contains(&self, name: &str) -> bool {
        self.targets.contains_key(name)
    }

    /// Look up a target cell.
    pub fn cell(&self, name: &str) -> CorralResult<&Arc<TargetCell>> {
        self.targets
            .get(name)
            .ok_or_else(|| CorralError::TargetNotFound {
                target: name.to_string(),
            })
    }

    /// Get a target's listing record.
    pub fn get(&self, name: &str) -> CorralResult<TargetView> {
        Ok(self.cell(name)?.view())
    }

    /// Current owner of a target.
    pub fn owner(&self, name: &str) -> CorralResult<Option<AllocationId>> {
        Ok(self.cell(name)?.owner())
    }

    /// Target names in stable order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    /// All targets in stable (lexicographic) order.
    ///
    /// Lock-free: retries if an ownership batch ran concurrently.
    pub fn list(&self) -> Vec<TargetView> {
        loop {
            let before = self.generation.load(Ordering::Acquire);
            if before % 2 == 1 {
                std::thread::yield_now();
                continue;
            }
            let views: Vec<TargetView> = self.targets.values().map(|c| c.view()).collect();
            fence(Ordering::Acquire);
            if self.generation.load(Ordering::Relaxed) == before {
                return views;
            }
        }
    }

    /// Compare-and-set a single target's owner.
    ///
    /// Fails with `Conflict` when the current owner is not `expected`.
    pub fn set_owner(
        &self,
        name: &str,
        expected: Option<AllocationId>,
        new: Option<AllocationId>,
    ) -> CorralResult<()> {
        let mut batch = self.batch();
        batch.set_owner(name, expected, new)
    }

    /// Start an ownership batch.
    pub fn batch(&self) -> OwnershipBatch<'_> {
        let guard = self.batch_lock.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        fence(Ordering::Release);
        OwnershipBatch {
            registry: self,
            _guard: guard,
            applied: Vec::new(),
        }
    }
}

/// A group of ownership changes published atomically to readers.
///
/// Changes take effect as they are applied; dropping the batch publishes
/// them. [`OwnershipBatch::rollback`] undoes everything applied so far.
pub struct OwnershipBatch<'a> {
    registry: &'a TargetRegistry,
    _guard: MutexGuard<'a, ()>,
    applied: Vec<(Arc<TargetCell>, Option<AllocationId>, Option<AllocationId>)>,
}

impl OwnershipBatch<'_> {
    /// Compare-and-set one owner within the batch.
    pub fn set_owner(
        &mut self,
        name: &str,
        expected: Option<AllocationId>,
        new: Option<AllocationId>,
    ) -> CorralResult<()> {
        let cell = Arc::clone(self.registry.cell(name)?);
        match cell.compare_and_set_owner(expected, new) {
            Ok(()) => {
                self.applied.push((cell, expected, new));
                Ok(())
            }
            Err(Some(owner)) => Err(CorralError::Conflict {
                target: name.to_string(),
                owner,
            }),
            Err(None) => Err(CorralError::internal(format!(
                "target {} is unowned, expected owner {:?}",
                name, expected
            ))),
        }
    }

    /// Undo every change applied in this batch, newest first.
    pub fn rollback(&mut self) {
        while let Some((cell, previous, applied)) = self.applied.pop() {
            if cell.compare_and_set_owner(applied, previous).is_err() {
                tracing::error!(target_name = %cell.name(), "ownership rollback lost a race");
            }
        }
    }

    /// Number of changes applied.
    pub fn len(&self) -> usize {
        self.applied.len()
    }

    /// Whether no change was applied.
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }
}

impl Drop for OwnershipBatch<'_> {
    fn drop(&mut self) {
        self.registry.generation.fetch_add(1, Ordering::Release);
    }
}
