//! Allocation manager integration tests.

mod common;

use common::{acquire, acquire_with, manager};
use corral::alloc::{AcquireRequest, AllocationState, Caller};
use corral::core::error::{CorralError, ErrorKind};
use std::time::Duration;

#[test]
fn free_targets_are_granted_immediately() {
    let (m, _) = manager(&["a", "b"]);
    let a = acquire(&m, "alice", &["b", "a"]);
    assert_eq!(a.state, AllocationState::Active);
    assert_eq!(a.granted, vec!["a", "b"]);
    assert_eq!(a.server, common::SERVER);
    assert_eq!(m.registry().owner("a").unwrap(), Some(a.id));
    assert_eq!(m.registry().owner("b").unwrap(), Some(a.id));
}

#[test]
fn partially_busy_request_waits_without_claiming() {
    let (m, _) = manager(&["a", "b"]);
    let holder = acquire(&m, "bob", &["b"]);
    let waiting = acquire(&m, "alice", &["a", "b"]);

    assert_eq!(waiting.state, AllocationState::Queued);
    assert!(waiting.granted.is_empty());
    assert_eq!(m.registry().owner("a").unwrap(), None);
    assert_eq!(m.registry().owner("b").unwrap(), Some(holder.id));

    m.release(&Caller::user("bob"), holder.id).unwrap();
    let granted = m.get(waiting.id).unwrap();
    assert_eq!(granted.state, AllocationState::Active);
    assert_eq!(m.registry().owner("a").unwrap(), Some(waiting.id));
    assert_eq!(m.registry().owner("b").unwrap(), Some(waiting.id));
}

#[test]
fn release_is_atomic_in_listings() {
    let (m, _) = manager(&["a", "b", "c"]);
    let a = acquire(&m, "alice", &["a", "b", "c"]);
    m.release(&Caller::user("alice"), a.id).unwrap();
    assert!(m.registry().list().iter().all(|t| t.owner.is_none()));
    let view = m.get(a.id).unwrap();
    assert_eq!(view.state, AllocationState::Released);
    assert!(view.granted.is_empty());
}

#[test]
fn lower_priority_value_wins() {
    let (m, _) = manager(&["a"]);
    let holder = acquire(&m, "holder", &["a"]);
    let low = acquire_with(&m, "low", &["a"], 5);
    let high = acquire_with(&m, "high", &["a"], 1);

    m.release(&Caller::user("holder"), holder.id).unwrap();
    assert_eq!(m.get(high.id).unwrap().state, AllocationState::Active);
    assert_eq!(m.get(low.id).unwrap().state, AllocationState::Queued);
}

#[test]
fn equal_priority_is_first_come_first_served() {
    let (m, clock) = manager(&["a"]);
    let holder = acquire(&m, "holder", &["a"]);
    let first = acquire_with(&m, "first", &["a"], 10);
    clock.advance_ms(1);
    let second = acquire_with(&m, "second", &["a"], 10);

    m.release(&Caller::user("holder"), holder.id).unwrap();
    assert_eq!(m.get(first.id).unwrap().state, AllocationState::Active);
    assert_eq!(m.get(second.id).unwrap().state, AllocationState::Queued);

    m.release(&Caller::user("first"), first.id).unwrap();
    assert_eq!(m.get(second.id).unwrap().state, AllocationState::Active);
}

#[test]
fn multi_target_request_is_not_starved() {
    let (m, _) = manager(&["a", "b"]);
    let on_a = acquire(&m, "u1", &["a"]);
    let on_b = acquire(&m, "u2", &["b"]);
    let gang = acquire(&m, "gang", &["a", "b"]);
    let latecomer = acquire(&m, "late", &["a"]);

    // A frees up, but the gang request heads A's queue.
    m.release(&Caller::user("u1"), on_a.id).unwrap();
    assert_eq!(m.get(latecomer.id).unwrap().state, AllocationState::Queued);
    assert_eq!(m.registry().owner("a").unwrap(), None);

    m.release(&Caller::user("u2"), on_b.id).unwrap();
    assert_eq!(m.get(gang.id).unwrap().state, AllocationState::Active);
    assert_eq!(m.get(latecomer.id).unwrap().state, AllocationState::Queued);
}

#[test]
fn withdrawing_a_queued_request_leaves_every_queue() {
    let (m, _) = manager(&["a", "b"]);
    let on_a = acquire(&m, "u1", &["a"]);
    let on_b = acquire(&m, "u2", &["b"]);
    let gang = acquire(&m, "gang", &["a", "b"]);
    let wants_a = acquire(&m, "wa", &["a"]);
    let wants_b = acquire(&m, "wb", &["b"]);

    let withdrawn = m.release(&Caller::user("gang"), gang.id).unwrap();
    assert_eq!(withdrawn.state, AllocationState::Released);

    m.release(&Caller::user("u1"), on_a.id).unwrap();
    m.release(&Caller::user("u2"), on_b.id).unwrap();
    assert_eq!(m.get(wants_a.id).unwrap().state, AllocationState::Active);
    assert_eq!(m.get(wants_b.id).unwrap().state, AllocationState::Active);
}

#[test]
fn non_queueing_request_fails_busy_and_leaves_nothing() {
    let (m, _) = manager(&["a", "b"]);
    acquire(&m, "holder", &["b"]);
    let before = m.list().len();

    let err = m
        .acquire(
            &Caller::user("alice"),
            AcquireRequest::new(["a", "b"]).no_queue(),
        )
        .unwrap_err();
    assert!(matches!(err, CorralError::Busy { ref target } if target == "b"));
    assert_eq!(m.list().len(), before);
    assert_eq!(m.registry().owner("a").unwrap(), None);
}

#[test]
fn only_owner_or_admin_may_release() {
    let (m, _) = manager(&["a"]);
    let a = acquire(&m, "alice", &["a"]);
    m.add_guest(&Caller::user("alice"), a.id, "gus").unwrap();

    let err = m.release(&Caller::user("mallory"), a.id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    let err = m.release(&Caller::user("gus"), a.id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert_eq!(m.get(a.id).unwrap().state, AllocationState::Active);

    let released = m.release(&Caller::admin("root"), a.id).unwrap();
    assert_eq!(released.state, AllocationState::Released);
}

#[test]
fn guests_gain_and_lose_access() {
    let (m, _) = manager(&["a"]);
    let a = acquire(&m, "alice", &["a"]);
    let gus = Caller::user("gus");

    assert!(m.check_access("a", &gus).is_err());
    m.add_guest(&Caller::user("alice"), a.id, "gus").unwrap();
    assert_eq!(m.check_access("a", &gus).unwrap(), a.id);
    m.keepalive(&gus, a.id).unwrap();

    let err = m.add_guest(&gus, a.id, "eve").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    m.remove_guest(&Caller::user("alice"), a.id, "gus").unwrap();
    assert_eq!(m.check_access("a", &gus).unwrap_err().kind(), ErrorKind::Forbidden);
}

#[test]
fn sweep_times_out_idle_holder_and_hands_over() {
    let (m, clock) = manager(&["a"]);
    let idle = acquire(&m, "idle", &["a"]);
    let waiter = acquire(&m, "waiter", &["a"]);

    clock.advance_ms(common::allocation_config().idle_timeout_ms - 1);
    assert!(m.sweep().is_empty());

    clock.advance_ms(1);
    let report = m.sweep();
    assert_eq!(report.timed_out, vec![idle.id]);
    assert_eq!(report.granted, vec![waiter.id]);

    let timed_out = m.get(idle.id).unwrap();
    assert_eq!(timed_out.state, AllocationState::TimedOut);
    assert!(timed_out.reason.is_some());
    assert_eq!(m.registry().owner("a").unwrap(), Some(waiter.id));
}

#[test]
fn queued_request_times_out_after_max_wait() {
    let (m, clock) = manager(&["a"]);
    let holder = acquire(&m, "holder", &["a"]);
    let waiter = acquire(&m, "waiter", &["a"]);

    // Keep the holder alive while the waiter ages out.
    let max_wait = common::allocation_config().queue_max_wait_ms;
    let step = common::allocation_config().idle_timeout_ms / 2;
    let mut elapsed = 0;
    while elapsed < max_wait {
        clock.advance_ms(step);
        elapsed += step;
        m.keepalive(&Caller::user("holder"), holder.id).unwrap();
        m.sweep();
    }

    assert_eq!(m.get(waiter.id).unwrap().state, AllocationState::TimedOut);
    assert_eq!(m.get(holder.id).unwrap().state, AllocationState::Active);
}

#[tokio::test]
async fn wait_returns_when_granted() {
    let (m, _) = manager(&["a"]);
    let holder = acquire(&m, "holder", &["a"]);
    let waiter = acquire(&m, "waiter", &["a"]);

    let releaser = {
        let m = m.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            m.release(&Caller::user("holder"), holder.id).unwrap();
        })
    };

    let view = m.wait(waiter.id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(view.state, AllocationState::Active);
    releaser.await.unwrap();
}

#[tokio::test]
async fn wait_gives_up_at_timeout() {
    let (m, _) = manager(&["a"]);
    acquire(&m, "holder", &["a"]);
    let waiter = acquire(&m, "waiter", &["a"]);

    let view = m.wait(waiter.id, Duration::from_millis(30)).await.unwrap();
    assert_eq!(view.state, AllocationState::Queued);
}

#[test]
fn stats_track_owned_targets() {
    let (m, _) = manager(&["a", "b", "c"]);
    acquire(&m, "alice", &["a", "b"]);
    acquire(&m, "bob", &["b"]);
    let stats = m.stats();
    assert_eq!(stats.active, 1);
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.owned_targets, 2);
}
