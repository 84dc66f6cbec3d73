//! Observed state of each domain
//!
//! Readers take snapshots; writers publish a new copy of the map. Many fibers read the
//! server map concurrently while the pod watcher applies events, and no lock is shared
//! between domains.

use crate::crd::{Domain, CLUSTER_NAME_LABEL, DOMAIN_UID_LABEL, SERVER_NAME_LABEL};
use arc_swap::{ArcSwap, ArcSwapOption};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Member servers of one cluster, in topology order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterConfig {
    pub cluster_name: String,
    pub server_names: Vec<String>,
}

/// Read-only view of the configured clusters
pub trait ClusterTopology: Send + Sync {
    fn cluster_config(&self, cluster_name: &str) -> Option<ClusterConfig>;
}

/// Cluster topology taken from the domain spec
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainTopology {
    clusters: BTreeMap<String, ClusterConfig>,
}

impl DomainTopology {
    pub fn from_domain(domain: &Domain) -> Self {
        let clusters = domain
            .spec
            .clusters
            .iter()
            .map(|c| {
                (
                    c.cluster_name.clone(),
                    ClusterConfig {
                        cluster_name: c.cluster_name.clone(),
                        server_names: c.servers.clone(),
                    },
                )
            })
            .collect();
        DomainTopology { clusters }
    }
}

impl ClusterTopology for DomainTopology {
    fn cluster_config(&self, cluster_name: &str) -> Option<ClusterConfig> {
        self.clusters.get(cluster_name).cloned()
    }
}

/// True when the pod has a `Ready` condition with status `True`
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

pub fn server_name_of(pod: &Pod) -> Option<&str> {
    pod.labels().get(SERVER_NAME_LABEL).map(String::as_str)
}

pub fn cluster_name_of(pod: &Pod) -> Option<&str> {
    pod.labels().get(CLUSTER_NAME_LABEL).map(String::as_str)
}

pub fn domain_uid_of(pod: &Pod) -> Option<&str> {
    pod.labels().get(DOMAIN_UID_LABEL).map(String::as_str)
}

/// Failure recorded against the domain, published with the next status update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedFailure {
    pub reason: String,
    pub message: String,
}

pub struct DomainPresenceInfo {
    namespace: String,
    domain_uid: String,
    domain: ArcSwapOption<Domain>,
    servers: ArcSwap<BTreeMap<String, Arc<Pod>>>,
    being_deleted: ArcSwap<BTreeSet<String>>,
    failure: ArcSwapOption<RecordedFailure>,
    rolling: AtomicBool,
}

impl DomainPresenceInfo {
    pub fn new(namespace: impl Into<String>, domain_uid: impl Into<String>) -> Self {
        DomainPresenceInfo {
            namespace: namespace.into(),
            domain_uid: domain_uid.into(),
            domain: ArcSwapOption::empty(),
            servers: ArcSwap::from_pointee(BTreeMap::new()),
            being_deleted: ArcSwap::from_pointee(BTreeSet::new()),
            failure: ArcSwapOption::empty(),
            rolling: AtomicBool::new(false),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn domain_uid(&self) -> &str {
        &self.domain_uid
    }

    pub fn domain(&self) -> Option<Arc<Domain>> {
        self.domain.load_full()
    }

    pub fn set_domain(&self, domain: Arc<Domain>) {
        self.domain.store(Some(domain));
    }

    /// Snapshot of server name to pod
    pub fn servers(&self) -> Arc<BTreeMap<String, Arc<Pod>>> {
        self.servers.load_full()
    }

    pub fn server_pod(&self, server_name: &str) -> Option<Arc<Pod>> {
        self.servers.load().get(server_name).cloned()
    }

    pub fn set_server_pod(&self, server_name: &str, pod: Arc<Pod>) {
        self.servers.rcu(|servers| {
            let mut servers = BTreeMap::clone(servers);
            servers.insert(server_name.to_string(), pod.clone());
            servers
        });
    }

    /// Replace the whole server map, as after a relist
    pub fn replace_server_pods(&self, servers: BTreeMap<String, Arc<Pod>>) {
        self.servers.store(Arc::new(servers));
    }

    pub fn remove_server_pod(&self, server_name: &str) {
        self.servers.rcu(|servers| {
            let mut servers = BTreeMap::clone(servers);
            servers.remove(server_name);
            servers
        });
    }

    pub fn mark_being_deleted(&self, server_name: &str) {
        self.being_deleted.rcu(|names| {
            let mut names = BTreeSet::clone(names);
            names.insert(server_name.to_string());
            names
        });
    }

    pub fn clear_being_deleted(&self, server_name: &str) {
        self.being_deleted.rcu(|names| {
            let mut names = BTreeSet::clone(names);
            names.remove(server_name);
            names
        });
    }

    pub fn is_server_pod_being_deleted(&self, server_name: &str) -> bool {
        self.being_deleted.load().contains(server_name)
    }

    /// Ready: the pod exists, is not terminating or being deleted, and reports Ready
    pub fn is_server_ready(&self, server_name: &str) -> bool {
        self.server_pod(server_name)
            .is_some_and(|pod| self.is_ready(server_name, &pod))
    }

    fn is_ready(&self, server_name: &str, pod: &Pod) -> bool {
        pod.metadata.deletion_timestamp.is_none()
            && !self.is_server_pod_being_deleted(server_name)
            && is_pod_ready(pod)
    }

    pub fn ready_servers(&self) -> BTreeSet<String> {
        self.servers()
            .iter()
            .filter(|(name, pod)| self.is_ready(name, pod))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Ready members of a cluster
    ///
    /// Membership comes from the topology when it lists the cluster's servers, else from pod
    /// labels.
    pub fn ready_servers_in_cluster(
        &self,
        cluster_name: &str,
        topology: Option<&dyn ClusterTopology>,
    ) -> BTreeSet<String> {
        let members = topology
            .and_then(|t| t.cluster_config(cluster_name))
            .filter(|config| !config.server_names.is_empty());
        let servers = self.servers();
        servers
            .iter()
            .filter(|(name, pod)| match &members {
                Some(config) => config.server_names.iter().any(|s| s == *name),
                None => cluster_name_of(pod) == Some(cluster_name),
            })
            .filter(|(name, pod)| self.is_ready(name, pod))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// 0 when the domain has not been seen yet
    pub fn min_available(&self, cluster_name: &str) -> usize {
        self.domain()
            .map(|d| d.min_available(cluster_name))
            .unwrap_or(0)
    }

    pub fn replica_count(&self, cluster_name: &str) -> i32 {
        self.domain()
            .map(|d| d.replica_count(cluster_name))
            .unwrap_or(0)
    }

    pub fn record_failure(&self, reason: &str, message: &str) {
        self.failure.store(Some(Arc::new(RecordedFailure {
            reason: reason.to_string(),
            message: message.to_string(),
        })));
    }

    pub fn failure(&self) -> Option<Arc<RecordedFailure>> {
        self.failure.load_full()
    }

    pub fn clear_failure(&self) {
        self.failure.store(None);
    }

    pub fn set_rolling(&self, rolling: bool) {
        self.rolling.store(rolling, Ordering::SeqCst);
    }

    pub fn is_rolling(&self) -> bool {
        self.rolling.load(Ordering::SeqCst)
    }
}

type DomainKey = (String, String);

/// Namespace, domain UID and server name of an operator-labelled pod
fn pod_identity(pod: &Pod) -> Option<(String, String, String)> {
    Some((
        pod.namespace()?,
        domain_uid_of(pod)?.to_string(),
        server_name_of(pod)?.to_string(),
    ))
}

/// Presence info of every known domain, keyed by namespace and domain UID
#[derive(Default)]
pub struct DomainPresenceRegistry {
    domains: ArcSwap<HashMap<DomainKey, Arc<DomainPresenceInfo>>>,
}

impl DomainPresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, namespace: &str, domain_uid: &str) -> Option<Arc<DomainPresenceInfo>> {
        self.domains
            .load()
            .get(&(namespace.to_string(), domain_uid.to_string()))
            .cloned()
    }

    pub fn get_or_create(&self, namespace: &str, domain_uid: &str) -> Arc<DomainPresenceInfo> {
        if let Some(info) = self.get(namespace, domain_uid) {
            return info;
        }
        let key = (namespace.to_string(), domain_uid.to_string());
        let created = Arc::new(DomainPresenceInfo::new(namespace, domain_uid));
        self.domains.rcu(|domains| {
            let mut domains = HashMap::clone(domains);
            domains.entry(key.clone()).or_insert_with(|| created.clone());
            domains
        });
        // another writer may have won the race
        self.get(namespace, domain_uid).unwrap_or(created)
    }

    pub fn remove(&self, namespace: &str, domain_uid: &str) {
        let key = (namespace.to_string(), domain_uid.to_string());
        self.domains.rcu(|domains| {
            let mut domains = HashMap::clone(domains);
            domains.remove(&key);
            domains
        });
    }

    pub fn len(&self) -> usize {
        self.domains.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.load().is_empty()
    }

    /// Record a created or updated server pod; pods without the operator labels are ignored
    pub fn pod_applied(&self, pod: Pod) {
        let Some((namespace, uid, server)) = pod_identity(&pod) else {
            return;
        };
        debug!(domain = %uid, server = %server, ready = is_pod_ready(&pod), "Server pod updated");
        self.get_or_create(&namespace, &uid)
            .set_server_pod(&server, Arc::new(pod));
    }

    /// Make the listed pods the complete set of known server pods
    ///
    /// Domains absent from the list lose all their pods; pods deleted while the watch was
    /// down disappear here.
    pub fn replace_pods(&self, pods: Vec<Pod>) {
        let mut listed: HashMap<DomainKey, BTreeMap<String, Arc<Pod>>> = HashMap::new();
        for pod in pods {
            if let Some((namespace, uid, server)) = pod_identity(&pod) {
                listed
                    .entry((namespace, uid))
                    .or_default()
                    .insert(server, Arc::new(pod));
            }
        }

        for (key, info) in self.domains.load().iter() {
            if !listed.contains_key(key) {
                info.replace_server_pods(BTreeMap::new());
            }
        }
        for ((namespace, uid), servers) in listed {
            debug!(domain = %uid, servers = servers.len(), "Server pods relisted");
            self.get_or_create(&namespace, &uid)
                .replace_server_pods(servers);
        }
    }

    pub fn pod_deleted(&self, pod: &Pod) {
        let (Some(namespace), Some(uid), Some(server)) =
            (pod.namespace(), domain_uid_of(pod), server_name_of(pod))
        else {
            return;
        };
        debug!(domain = %uid, server = %server, "Server pod deleted");
        if let Some(info) = self.get(&namespace, uid) {
            // a replacement pod may already be registered under the same server name
            let replaced = info
                .server_pod(server)
                .is_some_and(|current| current.uid() != pod.uid());
            if !replaced {
                info.remove_server_pod(server);
            }
        }
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
