//! Periodic allocation sweeper.

use super::allocation::AllocationId;
use super::manager::AllocationManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Allocations moved to `TimedOut`.
    pub timed_out: Vec<AllocationId>,
    /// Queued allocations granted after the timeouts freed targets.
    pub granted: Vec<AllocationId>,
    /// Terminal allocations dropped after retention.
    pub collected: Vec<AllocationId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.timed_out.is_empty() && self.granted.is_empty() && self.collected.is_empty()
    }
}

/// Run [`AllocationManager::sweep`] every `period` until shutdown.
pub fn spawn_sweeper(
    manager: Arc<AllocationManager>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = manager.sweep();
                    if !report.is_empty() {
                        tracing::debug!(
                            timed_out = report.timed_out.len(),
                            granted = report.granted.len(),
                            collected = report.collected.len(),
                            "sweep complete"
                        );
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("allocation sweeper stopped");
    })
}
