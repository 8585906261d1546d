//! Allocation manager.
//!
//! The manager owns allocation bookkeeping behind one mutex, which serializes
//! every ownership transaction. Target ownership itself lives in the
//! registry's atomic cells and is only changed through registry batches:
//!
//! - targets are claimed in lexicographic order, so concurrent gang requests
//!   never acquire in inconsistent orders;
//! - a claim that hits an owned target is rolled back completely, so a queued
//!   allocation never holds any target;
//! - after every release, withdrawal, timeout or new request the scheduler
//!   re-evaluates every queue head, not only the freed target's queue.
//!
//! Listings are served from an immutable snapshot republished after each
//! mutation.

use super::allocation::{
    AcquireRequest, Allocation, AllocationId, AllocationState, AllocationView, Caller,
};
use super::queue::{QueueKey, WaitQueues};
use super::sweep::SweepReport;
use crate::core::config::AllocationConfig;
use crate::core::error::{CorralError, CorralResult};
use crate::core::time::{Clock, Tick};
use crate::registry::TargetRegistry;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct ManagerState {
    allocations: BTreeMap<AllocationId, Allocation>,
    queues: WaitQueues,
    next_id: u64,
}

impl ManagerState {
    fn next_id(&mut self) -> AllocationId {
        let id = AllocationId(self.next_id);
        self.next_id += 1;
        id
    }
}

/// Allocation statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationStats {
    pub queued: usize,
    pub active: usize,
    pub terminal: usize,
    /// Targets currently owned.
    pub owned_targets: usize,
}

/// The contention core.
pub struct AllocationManager {
    server_id: String,
    registry: Arc<TargetRegistry>,
    clock: Arc<dyn Clock>,
    config: AllocationConfig,
    state: Mutex<ManagerState>,
    snapshot: RwLock<Arc<Vec<AllocationView>>>,
    /// Bumped after every mutation; waiters subscribe to it.
    changes: watch::Sender<u64>,
}

impl AllocationManager {
    /// Create a manager for a registry.
    pub fn new(
        server_id: impl Into<String>,
        registry: Arc<TargetRegistry>,
        clock: Arc<dyn Clock>,
        config: AllocationConfig,
    ) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            server_id: server_id.into(),
            registry,
            clock,
            config,
            state: Mutex::new(ManagerState {
                allocations: BTreeMap::new(),
                queues: WaitQueues::new(),
                next_id: 1,
            }),
            snapshot: RwLock::new(Arc::new(Vec::new())),
            changes,
        }
    }

    /// Server identity stamped on every allocation.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// The registry this manager allocates from.
    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    /// Allocation policy.
    pub fn config(&self) -> &AllocationConfig {
        &self.config
    }

    /// Request one or more targets.
    ///
    /// Returns the allocation, either `Active` (everything granted) or
    /// `Queued`. Non-queueing requests that cannot be granted at once fail
    /// with `Busy` and leave nothing behind.
    pub fn acquire(&self, caller: &Caller, request: AcquireRequest) -> CorralResult<AllocationView> {
        let priority = request.priority.unwrap_or(self.config.default_priority);
        let targets = self.validate_request(&request.targets, priority)?;
        let now = self.clock.now();

        let mut st = self.state.lock();
        let id = st.next_id();

        if let Some(missing) = targets.iter().find(|t| !self.registry.contains(t)) {
            let mut record = Allocation::new(id, caller.user.clone(), targets.clone(), priority, now);
            record.state = AllocationState::Invalid;
            record.ended_at = Some(now);
            record.reason = Some(format!("target {} does not exist", missing));
            st.allocations.insert(id, record);
            self.publish(&st);
            tracing::info!(
                allocation_id = %id,
                user = %caller.user,
                target_name = %missing,
                "allocation invalid: unknown target"
            );
            return Err(CorralError::TargetNotFound {
                target: missing.clone(),
            });
        }

        let key = QueueKey {
            priority,
            created_at: now,
            id,
        };
        st.queues.push(key, &targets);
        st.allocations.insert(
            id,
            Allocation::new(id, caller.user.clone(), targets.clone(), priority, now),
        );

        let granted = self.schedule(&mut st, now);

        if !granted.contains(&id) {
            if !request.queue {
                let blocker = self.first_blocker(&st, &key, &targets);
                st.queues.remove(&key, &targets);
                st.allocations.remove(&id);
                // Withdrawing may unblock nobody, but keep the scheduler's view exact.
                self.schedule(&mut st, now);
                self.publish(&st);
                tracing::debug!(
                    user = %caller.user,
                    target_name = %blocker,
                    "non-queueing acquire rejected"
                );
                return Err(CorralError::Busy { target: blocker });
            }
            tracing::info!(
                allocation_id = %id,
                user = %caller.user,
                priority,
                targets = ?targets,
                "allocation queued"
            );
        }

        let view = self.view_locked(&st, id)?;
        self.publish(&st);
        Ok(view)
    }

    /// Release an allocation (or withdraw it while queued).
    pub fn release(&self, caller: &Caller, id: AllocationId) -> CorralResult<AllocationView> {
        let now = self.clock.now();
        let mut st = self.state.lock();
        let record = st
            .allocations
            .get(&id)
            .ok_or(CorralError::AllocationNotFound { allocation_id: id })?;

        if record.user != caller.user && !caller.admin {
            return Err(CorralError::forbidden(format!(
                "user {} may not release allocation {} of user {}",
                caller.user, id, record.user
            )));
        }
        if record.state.is_terminal() {
            return Err(CorralError::invalid(format!(
                "allocation {} is already {}",
                id, record.state
            )));
        }

        self.terminate(&mut st, id, AllocationState::Released, None, now);
        tracing::info!(allocation_id = %id, user = %caller.user, "allocation released");
        self.schedule(&mut st, now);
        let view = self.view_locked(&st, id)?;
        self.publish(&st);
        Ok(view)
    }

    /// Refresh an allocation's keepalive deadline.
    pub fn keepalive(&self, caller: &Caller, id: AllocationId) -> CorralResult<AllocationView> {
        let now = self.clock.now();
        let mut st = self.state.lock();
        let record = st
            .allocations
            .get_mut(&id)
            .ok_or(CorralError::AllocationNotFound { allocation_id: id })?;

        if !record.admits(&caller.user) && !caller.admin {
            return Err(CorralError::forbidden(format!(
                "user {} is not part of allocation {}",
                caller.user, id
            )));
        }
        if !record.state.is_terminal() {
            record.last_keepalive = now;
        }
        let view = record.view(&self.server_id);
        self.publish(&st);
        Ok(view)
    }

    /// Admit a guest to an allocation.
    pub fn add_guest(
        &self,
        caller: &Caller,
        id: AllocationId,
        guest: &str,
    ) -> CorralResult<AllocationView> {
        self.update_guests(caller, id, |guests| {
            guests.insert(guest.to_string());
        })
    }

    /// Remove a guest from an allocation.
    pub fn remove_guest(
        &self,
        caller: &Caller,
        id: AllocationId,
        guest: &str,
    ) -> CorralResult<AllocationView> {
        self.update_guests(caller, id, |guests| {
            guests.remove(guest);
        })
    }

    fn update_guests<F>(&self, caller: &Caller, id: AllocationId, f: F) -> CorralResult<AllocationView>
    where
        F: FnOnce(&mut std::collections::BTreeSet<String>),
    {
        let mut st = self.state.lock();
        let record = st
            .allocations
            .get_mut(&id)
            .ok_or(CorralError::AllocationNotFound { allocation_id: id })?;
        if record.user != caller.user && !caller.admin {
            return Err(CorralError::forbidden(format!(
                "only user {} may change guests of allocation {}",
                record.user, id
            )));
        }
        if record.state.is_terminal() {
            return Err(CorralError::invalid(format!(
                "allocation {} is already {}",
                id, record.state
            )));
        }
        f(&mut record.guests);
        let view = record.view(&self.server_id);
        self.publish(&st);
        Ok(view)
    }

    /// Check that the caller may use a target right now.
    ///
    /// Returns the owning allocation; `Forbidden` unless the target is owned
    /// by an active allocation whose user or guests include the caller.
    pub fn check_access(&self, target: &str, caller: &Caller) -> CorralResult<AllocationId> {
        let owner = self.registry.owner(target)?.ok_or_else(|| {
            CorralError::forbidden(format!("target {} is not allocated", target))
        })?;
        let st = self.state.lock();
        match st.allocations.get(&owner) {
            Some(record) if record.state == AllocationState::Active && record.admits(&caller.user) => {
                Ok(owner)
            }
            _ => Err(CorralError::forbidden(format!(
                "target {} is allocated to {}, not usable by {}",
                target, owner, caller.user
            ))),
        }
    }

    /// Look up one allocation.
    pub fn get(&self, id: AllocationId) -> CorralResult<AllocationView> {
        self.snapshot
            .read()
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or(CorralError::AllocationNotFound { allocation_id: id })
    }

    /// All allocations, ordered by id. Read-only.
    pub fn list(&self) -> Vec<AllocationView> {
        let snapshot = Arc::clone(&self.snapshot.read());
        snapshot.as_ref().clone()
    }

    /// Wait until an allocation leaves `Queued` or the timeout elapses.
    ///
    /// Returns the latest view either way.
    pub async fn wait(&self, id: AllocationId, timeout: Duration) -> CorralResult<AllocationView> {
        let mut rx = self.changes.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let view = self.get(id)?;
            if view.state != AllocationState::Queued {
                return Ok(view);
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return Ok(view),
            }
        }
    }

    /// Time out stale allocations and collect expired terminal ones.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut st = self.state.lock();
        let mut report = SweepReport::default();

        let expired: Vec<(AllocationId, String)> = st
            .allocations
            .values()
            .filter_map(|a| match a.state {
                AllocationState::Queued
                    if now.ms_since(a.created_at) >= self.config.queue_max_wait_ms =>
                {
                    Some((
                        a.id,
                        format!(
                            "queued for targets {} longer than {}ms",
                            a.targets.join(","),
                            self.config.queue_max_wait_ms
                        ),
                    ))
                }
                AllocationState::Active
                    if now.ms_since(a.last_keepalive) >= self.config.idle_timeout_ms =>
                {
                    Some((
                        a.id,
                        format!(
                            "no keepalive for {}ms while holding {}",
                            self.config.idle_timeout_ms,
                            a.granted.join(",")
                        ),
                    ))
                }
                _ => None,
            })
            .collect();

        for (id, reason) in expired {
            tracing::info!(allocation_id = %id, reason = %reason, "allocation timed out");
            self.terminate(&mut st, id, AllocationState::TimedOut, Some(reason), now);
            report.timed_out.push(id);
        }

        report.granted = self.schedule(&mut st, now);

        let retention = self.config.retention_ms;
        let collected: Vec<AllocationId> = st
            .allocations
            .values()
            .filter(|a| {
                a.state.is_terminal()
                    && a.ended_at
                        .map(|end| now.ms_since(end) >= retention)
                        .unwrap_or(false)
            })
            .map(|a| a.id)
            .collect();
        for id in &collected {
            st.allocations.remove(id);
        }
        if !collected.is_empty() {
            tracing::debug!(count = collected.len(), "terminal allocations collected");
        }
        report.collected = collected;

        if !report.is_empty() {
            self.publish(&st);
        }
        report
    }

    /// Allocation statistics.
    pub fn stats(&self) -> AllocationStats {
        let snapshot = Arc::clone(&self.snapshot.read());
        let mut stats = AllocationStats::default();
        for a in snapshot.iter() {
            match a.state {
                AllocationState::Queued => stats.queued += 1,
                AllocationState::Active => {
                    stats.active += 1;
                    stats.owned_targets += a.granted.len();
                }
                _ => stats.terminal += 1,
            }
        }
        stats
    }

    fn validate_request(&self, targets: &[String], priority: u32) -> CorralResult<Vec<String>> {
        if targets.is_empty() {
            return Err(CorralError::invalid("acquire requires at least one target"));
        }
        let mut seen = HashSet::new();
        for name in targets {
            if name.trim().is_empty() {
                return Err(CorralError::invalid("target names must not be empty"));
            }
            if !seen.insert(name.as_str()) {
                return Err(CorralError::invalid(format!(
                    "target {} requested more than once",
                    name
                )));
            }
        }
        if priority > self.config.max_priority {
            return Err(CorralError::invalid(format!(
                "priority {} exceeds maximum {}",
                priority, self.config.max_priority
            )));
        }
        let mut sorted = targets.to_vec();
        sorted.sort();
        Ok(sorted)
    }

    /// Grant every queued allocation that heads all of its target queues and
    /// whose targets are all free. Returns the ids granted, best-ranked first.
    fn schedule(&self, st: &mut ManagerState, now: Tick) -> Vec<AllocationId> {
        let mut granted = Vec::new();
        let ManagerState {
            allocations,
            queues,
            ..
        } = st;

        for key in queues.heads() {
            let Some(record) = allocations.get_mut(&key.id) else {
                continue;
            };
            if record.state != AllocationState::Queued {
                continue;
            }
            let ready = record.targets.iter().all(|t| {
                queues.head(t) == Some(key)
                    && matches!(self.registry.owner(t), Ok(None))
            });
            if !ready {
                continue;
            }

            let mut batch = self.registry.batch();
            let mut claimed = true;
            for target in &record.targets {
                if let Err(e) = batch.set_owner(target, None, Some(key.id)) {
                    tracing::warn!(
                        allocation_id = %key.id,
                        error = %e,
                        "claim lost a race, rolling back"
                    );
                    batch.rollback();
                    claimed = false;
                    break;
                }
            }
            drop(batch);
            if !claimed {
                continue;
            }

            queues.remove(&key, &record.targets);
            record.state = AllocationState::Active;
            record.granted = record.targets.clone();
            record.granted_at = Some(now);
            record.last_keepalive = now;
            tracing::info!(
                allocation_id = %key.id,
                user = %record.user,
                targets = ?record.granted,
                "allocation active"
            );
            granted.push(key.id);
        }
        granted
    }

    /// Move a live allocation to a terminal state, freeing what it holds.
    fn terminate(
        &self,
        st: &mut ManagerState,
        id: AllocationId,
        state: AllocationState,
        reason: Option<String>,
        now: Tick,
    ) {
        let ManagerState {
            allocations,
            queues,
            ..
        } = st;
        let Some(record) = allocations.get_mut(&id) else {
            return;
        };

        match record.state {
            AllocationState::Queued => {
                let key = QueueKey {
                    priority: record.priority,
                    created_at: record.created_at,
                    id,
                };
                queues.remove(&key, &record.targets);
            }
            AllocationState::Active => {
                let mut batch = self.registry.batch();
                for target in &record.granted {
                    if let Err(e) = batch.set_owner(target, Some(id), None) {
                        tracing::error!(allocation_id = %id, error = %e, "release found foreign owner");
                    }
                }
            }
            _ => return,
        }

        record.granted.clear();
        record.state = state;
        record.ended_at = Some(now);
        record.reason = reason;
    }

    /// First target keeping a request from being granted.
    fn first_blocker(&self, st: &ManagerState, key: &QueueKey, targets: &[String]) -> String {
        targets
            .iter()
            .find(|t| {
                st.queues.head(t) != Some(*key) || !matches!(self.registry.owner(t), Ok(None))
            })
            .or_else(|| targets.first())
            .cloned()
            .unwrap_or_default()
    }

    fn view_locked(&self, st: &ManagerState, id: AllocationId) -> CorralResult<AllocationView> {
        st.allocations
            .get(&id)
            .map(|a| a.view(&self.server_id))
            .ok_or(CorralError::AllocationNotFound { allocation_id: id })
    }

    fn publish(&self, st: &ManagerState) {
        let views: Vec<AllocationView> = st
            .allocations
            .values()
            .map(|a| a.view(&self.server_id))
            .collect();
        *self.snapshot.write() = Arc::new(views);
        self.changes.send_modify(|generation| *generation += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TargetConfig;
    use crate::core::time::ManualClock;

    fn manager() -> (AllocationManager, Arc<ManualClock>) {
        let targets: Vec<TargetConfig> = ["a", "b", "c"]
            .iter()
            .map(|n| TargetConfig {
                name: n.to_string(),
                kind: "qemu".into(),
                ip: None,
                mac: None,
                components: vec!["main".into()],
            })
            .collect();
        let registry = Arc::new(TargetRegistry::new(&targets).unwrap());
        let clock = Arc::new(ManualClock::new(Tick::new(1_000)));
        let config = AllocationConfig {
            queue_max_wait_ms: 10_000,
            idle_timeout_ms: 5_000,
            retention_ms: 1_000,
            ..AllocationConfig::default()
        };
        let mgr = AllocationManager::new("lab", registry, clock.clone(), config);
        (mgr, clock)
    }

    #[test]
    fn validate_rejects_malformed() {
        let (mgr, _) = manager();
        let alice = Caller::user("alice");
        assert!(matches!(
            mgr.acquire(&alice, AcquireRequest::new(Vec::<String>::new())),
            Err(CorralError::InvalidRequest { .. })
        ));
        assert!(matches!(
            mgr.acquire(&alice, AcquireRequest::new(["a", "a"])),
            Err(CorralError::InvalidRequest { .. })
        ));
        assert!(matches!(
            mgr.acquire(&alice, AcquireRequest::new(["a"]).with_priority(5_000)),
            Err(CorralError::InvalidRequest { .. })
        ));
        assert!(mgr.list().is_empty());
    }

    #[test]
    fn unknown_target_records_invalid_allocation() {
        let (mgr, _) = manager();
        let err = mgr
            .acquire(&Caller::user("alice"), AcquireRequest::new(["a", "zz"]))
            .unwrap_err();
        assert!(matches!(err, CorralError::TargetNotFound { ref target } if target == "zz"));
        let list = mgr.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].state, AllocationState::Invalid);
        assert!(list[0].reason.as_deref().unwrap().contains("zz"));
        assert!(mgr.registry().owner("a").unwrap().is_none());
    }

    #[test]
    fn non_queueing_acquire_reports_busy_target() {
        let (mgr, _) = manager();
        mgr.acquire(&Caller::user("alice"), AcquireRequest::new(["b"]))
            .unwrap();
        let err = mgr
            .acquire(&Caller::user("bob"), AcquireRequest::new(["a", "b"]).no_queue())
            .unwrap_err();
        assert!(matches!(err, CorralError::Busy { ref target } if target == "b"));
        assert_eq!(mgr.list().len(), 1);
        assert!(mgr.registry().owner("a").unwrap().is_none());
    }

    #[test]
    fn keepalive_and_idle_timeout() {
        let (mgr, clock) = manager();
        let alice = Caller::user("alice");
        let a = mgr.acquire(&alice, AcquireRequest::new(["a"])).unwrap();
        clock.advance_ms(4_000);
        mgr.keepalive(&alice, a.id).unwrap();
        clock.advance_ms(4_000);
        assert!(mgr.sweep().timed_out.is_empty());
        clock.advance_ms(1_000);
        let report = mgr.sweep();
        assert_eq!(report.timed_out, vec![a.id]);
        let view = mgr.get(a.id).unwrap();
        assert_eq!(view.state, AllocationState::TimedOut);
        assert!(view.granted.is_empty());
        assert!(mgr.registry().owner("a").unwrap().is_none());
    }

    #[test]
    fn retention_collects_terminal_allocations() {
        let (mgr, clock) = manager();
        let alice = Caller::user("alice");
        let a = mgr.acquire(&alice, AcquireRequest::new(["a"])).unwrap();
        mgr.release(&alice, a.id).unwrap();
        assert!(mgr.sweep().collected.is_empty());
        clock.advance_ms(1_000);
        assert_eq!(mgr.sweep().collected, vec![a.id]);
        assert!(matches!(
            mgr.get(a.id),
            Err(CorralError::AllocationNotFound { .. })
        ));
    }

    #[test]
    fn release_twice_is_invalid() {
        let (mgr, _) = manager();
        let alice = Caller::user("alice");
        let a = mgr.acquire(&alice, AcquireRequest::new(["a"])).unwrap();
        mgr.release(&alice, a.id).unwrap();
        assert!(matches!(
            mgr.release(&alice, a.id),
            Err(CorralError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn stats_count_states() {
        let (mgr, _) = manager();
        let alice = Caller::user("alice");
        mgr.acquire(&alice, AcquireRequest::new(["a", "b"])).unwrap();
        mgr.acquire(&alice, AcquireRequest::new(["b"])).unwrap();
        assert_eq!(
            mgr.stats(),
            AllocationStats {
                queued: 1,
                active: 1,
                terminal: 0,
                owned_targets: 2,
            }
        );
    }
}
