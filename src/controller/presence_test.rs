#![allow(clippy::unwrap_used)]

use super::*;
use crate::controller::testing::{domain, server_pod, DOMAIN_UID, NAMESPACE};

fn info_with(pods: &[(&str, Option<&str>, bool)]) -> DomainPresenceInfo {
    let info = DomainPresenceInfo::new(NAMESPACE, DOMAIN_UID);
    for (server, cluster, ready) in pods {
        info.set_server_pod(server, Arc::new(server_pod(server, *cluster, *ready)));
    }
    info
}

#[test]
fn test_ready_servers_follow_ready_condition() {
    let info = info_with(&[
        ("admin", None, true),
        ("ms1", Some("c1"), true),
        ("ms2", Some("c1"), false),
    ]);

    let ready: Vec<String> = info.ready_servers().into_iter().collect();
    assert_eq!(ready, vec!["admin".to_string(), "ms1".to_string()]);
    assert!(info.is_server_ready("ms1"));
    assert!(!info.is_server_ready("ms2"));
    assert!(!info.is_server_ready("missing"));
}

#[test]
fn test_being_deleted_is_not_ready() {
    let info = info_with(&[("ms1", Some("c1"), true)]);

    info.mark_being_deleted("ms1");
    assert!(info.is_server_pod_being_deleted("ms1"));
    assert!(!info.is_server_ready("ms1"));

    info.clear_being_deleted("ms1");
    assert!(info.is_server_ready("ms1"));
}

#[test]
fn test_terminating_pod_is_not_ready() {
    let info = DomainPresenceInfo::new(NAMESPACE, DOMAIN_UID);
    let mut value = serde_json::to_value(server_pod("ms1", Some("c1"), true)).unwrap();
    value["metadata"]["deletionTimestamp"] = serde_json::Value::from("2026-01-01T00:00:00Z");
    let pod: Pod = serde_json::from_value(value).unwrap();
    info.set_server_pod("ms1", Arc::new(pod));

    assert!(!info.is_server_ready("ms1"));
}

#[test]
fn test_snapshot_unaffected_by_later_writes() {
    let info = info_with(&[("ms1", Some("c1"), true)]);

    let snapshot = info.servers();
    info.remove_server_pod("ms1");
    info.set_server_pod("ms2", Arc::new(server_pod("ms2", Some("c1"), true)));

    assert!(snapshot.contains_key("ms1"));
    assert!(!snapshot.contains_key("ms2"));
    assert!(info.server_pod("ms1").is_none());
}

#[test]
fn test_cluster_members_from_topology_or_labels() {
    let info = info_with(&[
        ("ms1", Some("c1"), true),
        ("ms2", Some("c1"), true),
        ("ms3", Some("c2"), true),
    ]);

    let by_label = info.ready_servers_in_cluster("c1", None);
    assert_eq!(by_label.len(), 2);

    let topology = DomainTopology::from_domain(&domain(&[("c1", 2, 1, &["ms1"])], "1"));
    let by_topology = info.ready_servers_in_cluster("c1", Some(&topology));
    assert_eq!(by_topology.into_iter().collect::<Vec<_>>(), vec!["ms1"]);
}

#[test]
fn test_min_available_comes_from_domain() {
    let info = DomainPresenceInfo::new(NAMESPACE, DOMAIN_UID);
    assert_eq!(info.min_available("c1"), 0);

    info.set_domain(Arc::new(domain(&[("c1", 5, 2, &[])], "1")));
    assert_eq!(info.min_available("c1"), 3);
    assert_eq!(info.replica_count("c1"), 5);
}

#[test]
fn test_registry_routes_pod_events() {
    let registry = DomainPresenceRegistry::new();
    registry.pod_applied(server_pod("ms1", Some("c1"), true));

    let info = registry.get(NAMESPACE, DOMAIN_UID).unwrap();
    assert!(info.is_server_ready("ms1"));

    registry.pod_deleted(&server_pod("ms1", Some("c1"), true));
    assert!(info.server_pod("ms1").is_none());
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_delete_of_replaced_pod_keeps_replacement() {
    let registry = DomainPresenceRegistry::new();
    let old = server_pod("ms1", Some("c1"), true);
    let replacement =
        crate::controller::testing::server_pod_with_version("ms1", Some("c1"), false, "2");
    registry.pod_applied(replacement);

    registry.pod_deleted(&old);

    let info = registry.get(NAMESPACE, DOMAIN_UID).unwrap();
    assert!(info.server_pod("ms1").is_some());
}

#[test]
fn test_pods_without_labels_are_ignored() {
    let registry = DomainPresenceRegistry::new();
    let mut pod = server_pod("ms1", None, true);
    pod.metadata.labels = None;

    registry.pod_applied(pod);
    assert!(registry.is_empty());
}

#[test]
fn test_get_or_create_returns_same_instance() {
    let registry = DomainPresenceRegistry::new();
    let a = registry.get_or_create(NAMESPACE, DOMAIN_UID);
    let b = registry.get_or_create(NAMESPACE, DOMAIN_UID);

    assert!(Arc::ptr_eq(&a, &b));

    registry.remove(NAMESPACE, DOMAIN_UID);
    assert!(registry.get(NAMESPACE, DOMAIN_UID).is_none());
}

#[test]
fn test_replace_pods_drops_pods_missing_from_list() {
    let registry = DomainPresenceRegistry::new();
    registry.pod_applied(server_pod("ms1", Some("c1"), true));
    registry.pod_applied(server_pod("ms2", Some("c1"), true));
    let stale = registry.get_or_create(NAMESPACE, "gone");
    stale.set_server_pod("ms1", Arc::new(server_pod("ms1", None, true)));

    registry.replace_pods(vec![server_pod("ms2", Some("c1"), true)]);

    let info = registry.get(NAMESPACE, DOMAIN_UID).unwrap();
    let servers: Vec<String> = info.servers().keys().cloned().collect();
    assert_eq!(servers, vec!["ms2".to_string()]);
    assert_eq!(info.ready_servers_in_cluster("c1", None).len(), 1);
    assert!(stale.servers().is_empty());
}
