#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use super::*;
use kube::CustomResourceExt;

const DOMAIN_YAML: &str = r#"
apiVersion: weblogic.oracle/v9
kind: Domain
metadata:
  name: domain1
  namespace: ns1
spec:
  domainUID: uid1
  replicas: 2
  restartVersion: "3"
  clusters:
  - clusterName: cluster-1
    replicas: 5
    maxUnavailable: 2
    servers: [ms1, ms2, ms3, ms4, ms5]
  - clusterName: cluster-2
    servers: [ms6, ms7]
"#;

fn domain() -> Domain {
    serde_yaml::from_str(DOMAIN_YAML).expect("Failed to deserialize Domain")
}

#[test]
fn test_domain_deserialize_from_yaml() {
    let domain = domain();

    assert_eq!(domain.metadata.name.as_deref(), Some("domain1"));
    assert_eq!(domain.domain_uid(), "uid1");
    assert_eq!(domain.restart_version(), "3");
    assert_eq!(domain.spec.clusters.len(), 2);
    assert_eq!(
        domain.cluster("cluster-1").map(|c| c.servers.len()),
        Some(5)
    );
    assert!(domain.status.is_none());
}

#[test]
fn test_domain_uid_defaults_to_name() {
    let yaml = r#"
apiVersion: weblogic.oracle/v9
kind: Domain
metadata:
  name: plain
spec: {}
"#;
    let domain: Domain = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(domain.domain_uid(), "plain");
    assert_eq!(domain.spec.replicas, 1);
    assert_eq!(domain.restart_version(), "");
}

#[test]
fn test_min_available_uses_cluster_settings() {
    let domain = domain();

    assert_eq!(domain.replica_count("cluster-1"), 5);
    assert_eq!(domain.max_unavailable("cluster-1"), 2);
    assert_eq!(domain.min_available("cluster-1"), 3);
}

#[test]
fn test_min_available_falls_back_to_domain_defaults() {
    let domain = domain();

    // replicas from the domain (2), max unavailable defaults to 1
    assert_eq!(domain.replica_count("cluster-2"), 2);
    assert_eq!(domain.max_unavailable("cluster-2"), DEFAULT_MAX_UNAVAILABLE);
    assert_eq!(domain.min_available("cluster-2"), 1);
    assert_eq!(domain.min_available("unknown"), 1);
}

#[test]
fn test_min_available_never_negative() {
    let mut domain = domain();
    domain.spec.max_cluster_unavailable = Some(10);

    assert_eq!(domain.min_available("cluster-2"), 0);
}

#[test]
fn test_set_condition_keeps_transition_time_when_unchanged() {
    let mut status = DomainStatus::default();
    status.set_condition(
        DomainCondition::new(DomainConditionType::Rolling, true),
        "2026-01-01T00:00:00Z",
    );
    status.set_condition(
        DomainCondition::new(DomainConditionType::Rolling, true).with_reason("StillRolling"),
        "2026-01-01T00:05:00Z",
    );

    let rolling = status.condition(DomainConditionType::Rolling).unwrap();
    assert_eq!(
        rolling.last_transition_time.as_deref(),
        Some("2026-01-01T00:00:00Z")
    );
    assert_eq!(rolling.reason.as_deref(), Some("StillRolling"));

    status.set_condition(
        DomainCondition::new(DomainConditionType::Rolling, false),
        "2026-01-01T00:10:00Z",
    );
    let rolling = status.condition(DomainConditionType::Rolling).unwrap();
    assert_eq!(
        rolling.last_transition_time.as_deref(),
        Some("2026-01-01T00:10:00Z")
    );
    assert!(!status.has_true_condition(DomainConditionType::Rolling));
}

#[test]
fn test_record_failure_sets_failed_condition() {
    let mut status = DomainStatus::default();
    status.record_failure("Kubernetes", "createPod failed", "2026-01-01T00:00:00Z");

    assert!(status.has_true_condition(DomainConditionType::Failed));
    assert_eq!(status.reason.as_deref(), Some("Kubernetes"));
    assert_eq!(status.message.as_deref(), Some("createPod failed"));

    status.remove_condition(DomainConditionType::Failed);
    assert!(status.condition(DomainConditionType::Failed).is_none());
}

#[test]
fn test_status_serializes_camel_case() {
    let status = DomainStatus {
        servers: vec![ServerStatus {
            server_name: "ms1".to_string(),
            cluster_name: Some("cluster-1".to_string()),
            state: Some("RUNNING".to_string()),
            ready: true,
        }],
        observed_generation: Some(4),
        ..Default::default()
    };

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["observedGeneration"], 4);
    assert_eq!(json["servers"][0]["serverName"], "ms1");
    assert_eq!(json["servers"][0]["clusterName"], "cluster-1");
}

#[test]
fn test_crd_has_status_subresource() {
    let crd = Domain::crd();

    assert_eq!(crd.spec.group, "weblogic.oracle");
    assert_eq!(crd.spec.names.kind, "Domain");
    assert_eq!(crd.spec.versions[0].name, "v9");
    assert!(crd.spec.versions[0]
        .subresources
        .as_ref()
        .and_then(|s| s.status.as_ref())
        .is_some());
}
