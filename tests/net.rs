//! End-to-end tests over the line protocol.
//!
//! Each test starts a full runtime on an ephemeral local port and talks to it
//! with the same client the CLI uses.

mod common;

use corral::adapters::{BrokerClient, BrokerRequest};
use corral::alloc::{AcquireRequest, AllocationState};
use corral::core::error::ErrorKind;
use corral::core::runtime::Runtime;
use corral::federation::FederatedView;
use corral::power::PowerCommand;
use corral::registry::PowerState;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

async fn start(server_id: &str, remotes: &[(&str, &str)]) -> Runtime {
    let mut runtime = Runtime::new(common::runtime_config(server_id, remotes)).unwrap();
    runtime.start().await.unwrap();
    assert!(runtime.is_ready());
    runtime
}

async fn client(runtime: &Runtime, user: &str) -> BrokerClient {
    let addr = runtime.local_addr().unwrap().to_string();
    BrokerClient::connect(&addr, user, Duration::from_secs(2))
        .await
        .unwrap()
}

#[tokio::test]
async fn acquire_power_release_round_trip() {
    let mut runtime = start("lab-a", &[]).await;
    let mut alice = client(&runtime, "alice").await;

    let body = alice
        .call(BrokerRequest::Acquire(AcquireRequest::new(["nuc-01"])))
        .await
        .unwrap();
    let allocation = body.allocation.unwrap();
    assert_eq!(allocation.state, AllocationState::Active);

    let body = alice
        .call(BrokerRequest::Power {
            target: "nuc-01".into(),
            component: "all".into(),
            command: PowerCommand::Cycle,
        })
        .await
        .unwrap();
    let report = body.power.unwrap();
    assert!(report.components.iter().all(|c| c.state == PowerState::On));

    let body = alice
        .call(BrokerRequest::ListTargets)
        .await
        .unwrap();
    let nuc = body
        .targets
        .unwrap()
        .into_iter()
        .find(|t| t.name == "nuc-01")
        .unwrap();
    assert_eq!(nuc.owner, Some(allocation.id));

    let body = alice
        .call(BrokerRequest::Release {
            allocation_id: allocation.id,
        })
        .await
        .unwrap();
    assert_eq!(body.allocation.unwrap().state, AllocationState::Released);

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn errors_carry_their_kind() {
    let mut runtime = start("lab-a", &[]).await;
    let mut alice = client(&runtime, "alice").await;
    let mut bob = client(&runtime, "bob").await;

    let allocation = alice
        .call(BrokerRequest::Acquire(AcquireRequest::new(["qemu-01"])))
        .await
        .unwrap()
        .allocation
        .unwrap();

    let err = bob
        .call(BrokerRequest::Release {
            allocation_id: allocation.id,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let err = bob
        .call(BrokerRequest::Acquire(AcquireRequest::new(["qemu-01"]).no_queue()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);

    let err = bob
        .call(BrokerRequest::Acquire(AcquireRequest::new(["qemu-99"])))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_line_gets_error_and_connection_survives() {
    let mut runtime = start("lab-a", &[]).await;
    let stream = TcpStream::connect(runtime.local_addr().unwrap())
        .await
        .unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(b"{not json}\n").await.unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(value["status"], "error");
    assert_eq!(value["kind"], "invalid");

    writer
        .write_all(b"{\"user\":\"alice\",\"request\":{\"op\":\"list_targets\"}}\n")
        .await
        .unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(value["status"], "ok");
    assert_eq!(value["targets"].as_array().unwrap().len(), 3);

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn queued_client_is_woken_by_wait() {
    let mut runtime = start("lab-a", &[]).await;
    let mut alice = client(&runtime, "alice").await;
    let mut bob = client(&runtime, "bob").await;

    let held = alice
        .call(BrokerRequest::Acquire(AcquireRequest::new(["qemu-02"])))
        .await
        .unwrap()
        .allocation
        .unwrap();
    let queued = bob
        .call(BrokerRequest::Acquire(AcquireRequest::new(["qemu-02"])))
        .await
        .unwrap()
        .allocation
        .unwrap();
    assert_eq!(queued.state, AllocationState::Queued);

    let waiter = tokio::spawn(async move {
        bob.call(BrokerRequest::Wait {
            allocation_id: queued.id,
            timeout_ms: 5_000,
        })
        .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    alice
        .call(BrokerRequest::Release {
            allocation_id: held.id,
        })
        .await
        .unwrap();

    let body = waiter.await.unwrap().unwrap();
    assert_eq!(body.allocation.unwrap().state, AllocationState::Active);

    runtime.stop().await.unwrap();
}

#[tokio::test]
async fn federated_listing_spans_servers_over_tcp() {
    let mut lab_b = start("lab-b", &[]).await;
    let b_addr = lab_b.local_addr().unwrap().to_string();
    let mut lab_a = start("lab-a", &[("lab-b", &b_addr), ("lab-c", "127.0.0.1:1")]).await;

    let mut alice_b = client(&lab_b, "alice").await;
    alice_b
        .call(BrokerRequest::Acquire(AcquireRequest::new(["qemu-01"])))
        .await
        .unwrap();

    // The background poller may race an explicit refresh; retry until the
    // new allocation shows up.
    let mut alice_a = client(&lab_a, "alice").await;
    let mut view = FederatedView::default();
    for _ in 0..50 {
        lab_a.gateway().unwrap().refresh().await;
        view = alice_a
            .call(BrokerRequest::FederatedListing)
            .await
            .unwrap()
            .federation
            .unwrap();
        if view.allocations.iter().any(|a| a.server == "lab-b") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(view.targets.len(), 6);
    assert!(view
        .allocations
        .iter()
        .any(|a| a.server == "lab-b" && a.record.state == AllocationState::Active));
    assert!(view.server("lab-c").unwrap().error.is_some());
    assert!(view.server("lab-a").unwrap().contributes());

    lab_a.stop().await.unwrap();
    lab_b.stop().await.unwrap();
}

#[tokio::test]
async fn commands_are_forwarded_to_the_named_server() {
    let mut lab_b = start("lab-b", &[]).await;
    let b_addr = lab_b.local_addr().unwrap().to_string();
    let mut lab_a = start("lab-a", &[("lab-b", &b_addr)]).await;

    let mut alice = client(&lab_a, "alice").await.route_to("lab-b");
    let allocation = alice
        .call(BrokerRequest::Acquire(AcquireRequest::new(["nuc-01"])))
        .await
        .unwrap()
        .allocation
        .unwrap();
    assert_eq!(allocation.server, "lab-b");
    assert_eq!(allocation.state, AllocationState::Active);

    // Held on lab-b, free on lab-a.
    let mut direct_b = client(&lab_b, "alice").await;
    let held = direct_b
        .call(BrokerRequest::ListAllocations)
        .await
        .unwrap()
        .allocations
        .unwrap();
    assert!(held.iter().any(|a| a.id == allocation.id));
    let mut local_a = client(&lab_a, "alice").await;
    let local = local_a
        .call(BrokerRequest::ListAllocations)
        .await
        .unwrap()
        .allocations
        .unwrap();
    assert!(local.is_empty());

    // Errors from the remote keep their kind.
    let mut bob = client(&lab_a, "bob").await.route_to("lab-b");
    let err = bob
        .call(BrokerRequest::Release {
            allocation_id: allocation.id,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    let body = alice
        .call(BrokerRequest::Release {
            allocation_id: allocation.id,
        })
        .await
        .unwrap();
    assert_eq!(body.allocation.unwrap().state, AllocationState::Released);

    let mut lost = client(&lab_a, "alice").await.route_to("lab-z");
    let err = lost.call(BrokerRequest::ListTargets).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);

    lab_a.stop().await.unwrap();
    lab_b.stop().await.unwrap();
}

#[tokio::test]
async fn envelope_naming_the_receiver_runs_locally() {
    let mut runtime = start("lab-a", &[]).await;
    let mut alice = client(&runtime, "alice").await.route_to("lab-a");
    let allocation = alice
        .call(BrokerRequest::Acquire(AcquireRequest::new(["qemu-01"])))
        .await
        .unwrap()
        .allocation
        .unwrap();
    assert_eq!(allocation.server, "lab-a");
    runtime.stop().await.unwrap();
}
