// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for registry-proxy-operator.
//!
//! Uses proptest to generate random inputs and verify invariants.

use std::collections::BTreeSet;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use proptest::prelude::*;

use registry_proxy_operator::OperatorConfig;
use registry_proxy_operator::controller::arbiter::{Election, elect};
use registry_proxy_operator::controller::engine::RequeueSignal;
use registry_proxy_operator::controller::manifest::render_template;
use registry_proxy_operator::crd::{
    Condition, ConditionStatus, Conditions, Connection, ConnectionSpec, RegistryProxy,
    RegistryProxySpec, RegistryProxyStatus, Served,
};
use registry_proxy_operator::resources::deployment::{
    AuthorizationTarget, ProxyWorkload, deployment_changed, generate_deployment,
};

const TYPES: [&str; 4] = ["Installed", "Configured", "Deleted", "PrerequisitesSatisfied"];

/// Strategy for generating random condition statuses.
fn any_status() -> impl Strategy<Value = ConditionStatus> {
    prop_oneof![
        Just(ConditionStatus::True),
        Just(ConditionStatus::False),
        Just(ConditionStatus::Unknown),
    ]
}

/// Strategy for one condition write: (type index, status, reason).
fn condition_write() -> impl Strategy<Value = (usize, ConditionStatus, String)> {
    (0..TYPES.len(), any_status(), "[A-Z][a-zA-Z]{0,12}")
}

fn registry_proxy(index: usize, created_secs: i64) -> RegistryProxy {
    let name = format!("rp-{index}");
    let mut rp = RegistryProxy::new(&name, RegistryProxySpec::default());
    rp.metadata.namespace = Some(format!("ns-{}", index % 3));
    rp.metadata.uid = Some(format!("uid-{index}"));
    rp.metadata.creation_timestamp = Some(Time(jiff::Timestamp::from_second(created_secs).unwrap()));
    rp
}

proptest! {
    /// Property: the ledger never holds two conditions of the same type.
    #[test]
    fn test_one_condition_per_type(writes in prop::collection::vec(condition_write(), 0..40)) {
        let mut conditions = Conditions::new();
        let mut seen = BTreeSet::new();
        for (idx, status, reason) in &writes {
            conditions.set(Condition::new(TYPES[*idx], *status, reason, "message"));
            seen.insert(TYPES[*idx]);
        }

        prop_assert_eq!(conditions.len(), seen.len());
        let types: BTreeSet<_> = conditions.iter().map(|c| c.r#type.as_str()).collect();
        prop_assert_eq!(types, seen);
    }

    /// Property: the transition time only moves when the status changes.
    #[test]
    fn test_transition_time_follows_status(writes in prop::collection::vec((any_status(), "[A-Z][a-z]{0,8}"), 1..20)) {
        let mut conditions = Conditions::new();
        let mut expected_time = String::new();
        let mut last_status = None;

        for (i, (status, reason)) in writes.iter().enumerate() {
            let stamp = format!("2024-01-01T00:00:{:02}Z", i);
            conditions.set(Condition {
                last_transition_time: stamp.clone(),
                ..Condition::new("Ready", *status, reason, "")
            });
            if last_status != Some(*status) {
                expected_time = stamp;
                last_status = Some(*status);
            }
            let stored = conditions.get("Ready").unwrap();
            prop_assert_eq!(&stored.last_transition_time, &expected_time);
            prop_assert_eq!(&stored.reason, reason);
        }
    }

    /// Property: however the ticks of N new instances are ordered, exactly
    /// one instance ends up served, and it is the oldest.
    #[test]
    fn test_exactly_one_served(
        created in prop::collection::vec(0i64..50, 1..8),
        order_seed in any::<u64>()
    ) {
        let mut peers: Vec<RegistryProxy> = created
            .iter()
            .enumerate()
            .map(|(i, secs)| registry_proxy(i, *secs))
            .collect();

        let mut order: Vec<usize> = (0..peers.len()).collect();
        // Deterministic shuffle from the seed
        let mut seed = order_seed;
        for i in (1..order.len()).rev() {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let j = usize::try_from(seed >> 33).unwrap() % (i + 1);
            order.swap(i, j);
        }

        // Deferred instances are ticked again on a later pass
        let mut passes = 0;
        while peers.iter().any(|rp| rp.served().is_none()) {
            passes += 1;
            prop_assert!(passes <= peers.len() + 1, "election does not settle");
            for &idx in &order {
                if peers[idx].served().is_some() {
                    continue;
                }
                let served = match elect(&peers[idx], &peers) {
                    Election::Served => Served::True,
                    Election::Redundant { .. } => Served::False,
                    Election::Deferred { .. } => continue,
                };
                peers[idx].status = Some(RegistryProxyStatus {
                    served: Some(served),
                    ..Default::default()
                });
            }
        }

        let winners: Vec<_> = peers.iter().filter(|rp| rp.served() == Some(Served::True)).collect();
        prop_assert_eq!(winners.len(), 1);
        let oldest = created.iter().min().unwrap();
        prop_assert_eq!(
            winners[0].metadata.creation_timestamp.as_ref().unwrap().0.as_second(),
            *oldest
        );
    }

    /// Property: Deployment drift detection ignores container order.
    #[test]
    fn test_container_order_is_not_drift(
        target in "[a-z]{1,10}\\.internal:[0-9]{4}",
        auth_host in "[a-z]{1,10}\\.auth",
        node_port in 30000i32..32767
    ) {
        let mut conn = Connection::new("my-registry", ConnectionSpec::default());
        conn.metadata.namespace = Some("default".to_string());
        let workload = ProxyWorkload {
            proxy_url: "http://proxy:20003",
            target_host: &target,
            authorization: Some(AuthorizationTarget { host: &auth_host, node_port }),
            ..Default::default()
        };
        let config = OperatorConfig::default();
        let desired = generate_deployment(&conn, &workload, &config);

        let mut current = desired.clone();
        current
            .spec
            .as_mut()
            .unwrap()
            .template
            .spec
            .as_mut()
            .unwrap()
            .containers
            .reverse();

        prop_assert!(!deployment_changed(&current, &desired));
    }

    /// Property: text without placeholders renders unchanged.
    #[test]
    fn test_plain_text_renders_verbatim(text in "[^{}]*") {
        let rendered = render_template(&text, &serde_json::json!({}));
        prop_assert_eq!(rendered, text);
    }

    /// Property: requeue signals always map to the requested delay.
    #[test]
    fn test_requeue_after_maps_to_action(secs in 0u64..86_400) {
        let resync = std::time::Duration::from_secs(600);
        let after = std::time::Duration::from_secs(secs);
        prop_assert_eq!(
            RequeueSignal::After(after).into_action(resync),
            kube::runtime::controller::Action::requeue(after)
        );
    }
}
