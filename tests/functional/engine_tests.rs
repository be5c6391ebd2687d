//! Write minimality and idempotence across ticks.

use std::time::Duration;

use crate::common::fixtures::{ConnectionBuilder, RegistryProxyBuilder, pod_for};
use crate::{Harness, Op};
use registry_proxy_operator::controller::connection_states::{ConnectionMachine, ConnectionState};
use registry_proxy_operator::controller::engine::{RequeueSignal, run};
use registry_proxy_operator::controller::error::Error;
use registry_proxy_operator::crd::{Connection, RegistryProxy};

async fn converged_connection(harness: &Harness) {
    harness.cluster.insert(
        &ConnectionBuilder::new("my-registry")
            .proxy_url("http://proxy.example:20003")
            .build(),
    );
    // Deployment, then pod + Service, then status
    harness.tick_connection("default", "my-registry").await.unwrap();
    let deployment = harness.cluster.object("default", "my-registry").unwrap();
    harness
        .cluster
        .insert(&pod_for(&deployment, "my-registry-abc", "10.0.0.7", 2_000));
    harness.tick_connection("default", "my-registry").await.unwrap();
    let signal = harness.tick_connection("default", "my-registry").await.unwrap();
    assert_eq!(signal, RequeueSignal::None);
}

#[tokio::test]
async fn test_converged_connection_tick_writes_nothing() {
    let harness = Harness::new();
    converged_connection(&harness).await;
    harness.cluster.clear_writes();

    for _ in 0..3 {
        let signal = harness.tick_connection("default", "my-registry").await.unwrap();
        assert_eq!(signal, RequeueSignal::None);
    }
    assert!(harness.cluster.writes().is_empty());
}

#[tokio::test]
async fn test_converged_registry_proxy_tick_writes_nothing() {
    let harness = Harness::with_connectivity_proxy();
    harness.cluster.insert(&RegistryProxyBuilder::new("default").build());
    harness.tick_registry_proxy("kyma-system", "default").await.0.unwrap();
    let before: RegistryProxy = harness.cluster.object("kyma-system", "default").unwrap();
    harness.cluster.clear_writes();

    let (outcome, milestones) = harness.tick_registry_proxy("kyma-system", "default").await;

    assert_eq!(outcome.unwrap(), RequeueSignal::None);
    assert!(harness.cluster.writes().is_empty());
    assert!(milestones.is_empty());
    let after: RegistryProxy = harness.cluster.object("kyma-system", "default").unwrap();
    assert_eq!(after.status, before.status);
}

#[tokio::test]
async fn test_status_written_only_after_changing_steps() {
    let harness = Harness::with_connectivity_proxy();
    harness.cluster.insert(&RegistryProxyBuilder::new("default").build());

    harness.tick_registry_proxy("kyma-system", "default").await.0.unwrap();

    // Served, PrerequisitesSatisfied, Installed=Unknown, Ready; the finalizer
    // and state-only steps add no status writes of their own
    assert_eq!(harness.cluster.count(Op::UpdateStatus, "RegistryProxy"), 4);
    assert_eq!(harness.cluster.count(Op::Update, "RegistryProxy"), 1);
}

#[tokio::test]
async fn test_requeue_ticks_do_not_rewrite_status() {
    let harness = Harness::new();
    harness.cluster.insert(&ConnectionBuilder::new("my-registry").build());

    let first = harness.tick_connection("default", "my-registry").await.unwrap();
    assert_eq!(first, RequeueSignal::After(Duration::from_secs(60)));
    assert_eq!(harness.cluster.count(Op::UpdateStatus, "Connection"), 1);

    harness.cluster.clear_writes();
    harness.tick_connection("default", "my-registry").await.unwrap();
    assert!(harness.cluster.writes().is_empty());
}

#[tokio::test]
async fn test_stale_copy_conflicts() {
    let harness = Harness::new();
    harness.cluster.insert(
        &ConnectionBuilder::new("my-registry")
            .proxy_url("http://proxy.example:20003")
            .build(),
    );
    let stale: Connection = harness.cluster.object("default", "my-registry").unwrap();
    harness
        .cluster
        .modify::<Connection>("default", "my-registry", |conn| {
            conn.spec.target.host = "mirror.internal:5000".to_string();
        });

    let mut machine = ConnectionMachine::new(stale, harness.deps());
    let result = run(&mut machine, ConnectionState::ValidateDependency, &harness.cancel).await;

    let err = result.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(err.requeue_after(), Duration::from_secs(1));
}

#[tokio::test]
async fn test_cancelled_tick_does_nothing() {
    let harness = Harness::with_connectivity_proxy();
    harness.cluster.insert(&RegistryProxyBuilder::new("default").build());
    harness.cancel.cancel();

    let (outcome, _) = harness.tick_registry_proxy("kyma-system", "default").await;

    assert!(matches!(outcome, Err(Error::Cancelled)));
    assert!(harness.cluster.writes().is_empty());
    assert!(harness.installer.calls().is_empty());
}
