// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Unit tests for registry-proxy-operator.
//!
//! These tests run without a Kubernetes cluster and test individual
//! components in isolation.

#[path = "../common/mod.rs"]
mod common;

mod crd_tests {
    use registry_proxy_operator::crd::{
        ConditionStatus, Connection, ImagePullReverseProxy, LogLevel, RegistryProxy, Served, State,
    };

    #[test]
    fn test_registry_proxy_from_yaml() {
        let rp: RegistryProxy = serde_yaml::from_str(
            r#"
apiVersion: operator.kyma-project.io/v1alpha1
kind: RegistryProxy
metadata:
  name: default
  namespace: kyma-system
spec:
  proxy:
    url: http://proxy:20003
    locationID: loc-1
status:
  state: Ready
  served: "True"
  conditions:
    - type: Installed
      status: "True"
      reason: Installed
      message: Registry Proxy installed
      lastTransitionTime: "2024-01-01T00:00:00Z"
"#,
        )
        .unwrap();

        assert_eq!(rp.spec.proxy.url(), Some("http://proxy:20003"));
        assert_eq!(rp.spec.proxy.location_id(), "loc-1");
        let status = rp.status.unwrap();
        assert_eq!(status.state, Some(State::Ready));
        assert_eq!(status.served, Some(Served::True));
        assert_eq!(status.conditions.get("Installed").unwrap().status, ConditionStatus::True);
    }

    #[test]
    fn test_connection_from_yaml() {
        let conn: Connection = serde_yaml::from_str(
            r#"
apiVersion: registry-proxy.kyma-project.io/v1alpha1
kind: Connection
metadata:
  name: my-registry
  namespace: default
spec:
  target:
    host: registry.internal:5000
    authorization:
      host: auth.registry.internal
  logLevel: debug
  nodePort: 31000
  resources:
    limits:
      cpu: 200m
"#,
        )
        .unwrap();

        assert_eq!(conn.spec.target.host, "registry.internal:5000");
        assert_eq!(conn.spec.target.authorization.host(), Some("auth.registry.internal"));
        assert_eq!(conn.spec.log_level, LogLevel::Debug);
        assert_eq!(conn.spec.node_port, Some(31000));
        let limits = conn.spec.resources.unwrap().limits.unwrap();
        assert_eq!(limits.cpu.as_deref(), Some("200m"));
        assert!(limits.memory.is_none());
    }

    #[test]
    fn test_reverse_proxy_from_yaml() {
        let rp: ImagePullReverseProxy = serde_yaml::from_str(
            r#"
apiVersion: operator.kyma-project.io/v1alpha1
kind: ImagePullReverseProxy
metadata:
  name: legacy
spec:
  proxyURL: http://proxy:20003
  targetHost: registry.internal:5000
"#,
        )
        .unwrap();

        assert_eq!(rp.spec.proxy_url.as_deref(), Some("http://proxy:20003"));
        assert_eq!(rp.spec.target_host, "registry.internal:5000");
        assert!(rp.spec.log_level.is_none());
    }

    #[test]
    fn test_condition_status_strings() {
        assert_eq!(serde_json::to_string(&ConditionStatus::True).unwrap(), "\"True\"");
        assert_eq!(ConditionStatus::from_bool(false), ConditionStatus::False);
        assert_eq!(ConditionStatus::default(), ConditionStatus::Unknown);
    }
}

mod error_tests {
    use std::time::Duration;

    use registry_proxy_operator::controller::error::Error;

    fn api_error(code: u16) -> Error {
        Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(api_error(504).is_retryable());
        assert!(!api_error(403).is_retryable());
        assert!(!Error::Validation("invalid spec".to_string()).is_retryable());
        assert!(Error::Transient("temporary failure".to_string()).is_retryable());
        assert!(!Error::OrphanResources("found 1 items".to_string()).is_retryable());
    }

    #[test]
    fn test_requeue_classes() {
        assert_eq!(api_error(409).requeue_after(), Duration::from_secs(1));
        assert_eq!(api_error(503).requeue_after(), Duration::from_secs(30));
        assert_eq!(
            Error::Manifest("bad template".to_string()).requeue_after(),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn test_orphan_message_is_verbatim() {
        let err = Error::OrphanResources("found 2 items with VersionKind g/v1".to_string());
        assert_eq!(err.to_string(), "found 2 items with VersionKind g/v1");
    }
}

mod config_tests {
    use std::time::Duration;

    use registry_proxy_operator::OperatorConfig;

    #[test]
    fn test_from_lookup() {
        let config = OperatorConfig::from_lookup(|key| match key {
            "PROXY_IMAGE" => Some("registry-proxy:1.0".to_string()),
            "MODULE_NAMESPACE" => Some("custom-system".to_string()),
            "PROBE_TIMEOUT_SECS" => Some(" 2 ".to_string()),
            _ => None,
        });

        assert_eq!(config.proxy_image, "registry-proxy:1.0");
        assert_eq!(config.module_namespace, "custom-system");
        assert_eq!(config.probe_timeout, Duration::from_secs(2));
        assert!(config.watch_namespace.is_none());
    }
}

mod resources_tests {
    use crate::common::fixtures::{ConnectionBuilder, reverse_proxy};
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use registry_proxy_operator::OperatorConfig;
    use registry_proxy_operator::resources::deployment::{
        AuthorizationTarget, ProxyWorkload, deployment_changed, generate_deployment,
    };
    use registry_proxy_operator::resources::services::{
        ServiceOptions, generate_service, node_port, service_changed,
    };

    fn config() -> OperatorConfig {
        OperatorConfig {
            proxy_image: "registry-proxy:1.0".to_string(),
            proxy_command: "/app/registry-proxy".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_deployment_for_connection() {
        let conn = ConnectionBuilder::new("my-registry").build();
        let workload = ProxyWorkload {
            proxy_url: "http://proxy:20003",
            target_host: "registry.internal:5000",
            authorization: Some(AuthorizationTarget {
                host: "auth.internal",
                node_port: 30001,
            }),
            ..Default::default()
        };
        let deployment = generate_deployment(&conn, &workload, &config());

        assert_eq!(deployment.metadata.name.as_deref(), Some("my-registry"));
        assert_eq!(deployment.metadata.namespace.as_deref(), Some("default"));
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        let containers = spec.template.spec.unwrap().containers;
        let names: Vec<_> = containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["registry", "authorization"]);
        assert_eq!(containers[0].image.as_deref(), Some("registry-proxy:1.0"));
        assert_eq!(
            containers[1].liveness_probe.as_ref().unwrap().http_get.as_ref().unwrap().port,
            IntOrString::Int(8083)
        );
    }

    #[test]
    fn test_legacy_deployment_change_detection() {
        let rp = reverse_proxy("legacy", "tenant", "http://proxy:20003", "registry.internal:5000");
        let workload = ProxyWorkload {
            proxy_url: "http://proxy:20003",
            target_host: "registry.internal:5000",
            ..Default::default()
        };
        let current = generate_deployment(&rp, &workload, &config());
        let same = generate_deployment(&rp, &workload, &config());
        assert!(!deployment_changed(&current, &same));

        let moved = ProxyWorkload {
            target_host: "mirror.internal:5000",
            ..workload
        };
        assert!(deployment_changed(&current, &generate_deployment(&rp, &moved, &config())));
    }

    #[test]
    fn test_service_ports() {
        let conn = ConnectionBuilder::new("my-registry").build();
        let mut service = generate_service(
            &conn,
            ServiceOptions {
                node_port: None,
                authorization: true,
            },
        );
        assert_eq!(node_port(&service, "registry"), 0);

        // The platform assigns ports; that alone is no drift
        let desired = service.clone();
        for (port, assigned) in service
            .spec
            .as_mut()
            .unwrap()
            .ports
            .as_mut()
            .unwrap()
            .iter_mut()
            .zip([30000, 30001])
        {
            port.node_port = Some(assigned);
        }
        assert!(!service_changed(&service, &desired));
        assert_eq!(node_port(&service, "authorization"), 30001);

        let pinned = generate_service(
            &conn,
            ServiceOptions {
                node_port: Some(31000),
                authorization: true,
            },
        );
        assert!(service_changed(&service, &pinned));
    }
}

mod manifest_tests {
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentStatus};
    use registry_proxy_operator::controller::installer::InstallFlags;
    use registry_proxy_operator::controller::manifest::{
        deployment_verification, kind_priority, parse_documents, render_template,
    };

    #[test]
    fn test_render_and_parse() {
        let values = InstallFlags::new()
            .with_image_connection("connection:2.0")
            .with_istio_installed(false)
            .build();
        let template = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: connection-controller
  namespace: kyma-system
spec:
  template:
    spec:
      containers:
        - name: manager
          image: {{ .Values.global.images.connection }}
          env:
            - name: ISTIO_INSTALLED
              value: {{ .Values.controllerManager.container.env.ISTIO_INSTALLED }}
            - name: EMPTY
              value: "{{ .Values.global.missing }}"
---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: connection-controller
"#;
        let objects = parse_documents(&render_template(template, &values)).unwrap();

        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].kind, "Deployment");
        assert_eq!(objects[0].namespace.as_deref(), Some("kyma-system"));
        let container = &objects[0].value["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], "connection:2.0");
        assert_eq!(container["env"][0]["value"], "false");
        assert_eq!(container["env"][1]["value"], "");
        assert!(objects[1].namespace.is_none());
        assert!(kind_priority(&objects[1].kind) < kind_priority(&objects[0].kind));
    }

    #[test]
    fn test_document_without_kind_is_rejected() {
        let err = parse_documents("apiVersion: v1\nmetadata:\n  name: x\n").unwrap_err();
        assert!(err.to_string().contains("document without kind"));
    }

    fn deployment(conditions: Vec<(&str, &str, Option<&str>)>) -> Deployment {
        Deployment {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some("registry-proxy-controller".to_string()),
                ..Default::default()
            },
            status: Some(DeploymentStatus {
                conditions: Some(
                    conditions
                        .into_iter()
                        .map(|(type_, status, reason)| DeploymentCondition {
                            type_: type_.to_string(),
                            status: status.to_string(),
                            reason: reason.map(str::to_string),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_deployment_verification() {
        assert!(deployment_verification(&deployment(vec![("Available", "True", None)])).ready);
        assert!(
            deployment_verification(&deployment(vec![("Progressing", "True", None)])).is_processing()
        );

        let failed = deployment_verification(&deployment(vec![(
            "Progressing",
            "False",
            Some("ProgressDeadlineExceeded"),
        )]));
        assert!(!failed.ready);
        assert!(!failed.is_processing());
        assert!(failed.reason.contains("progress deadline exceeded"));
    }
}
