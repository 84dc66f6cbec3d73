use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label on server pods naming the owning domain
pub const DOMAIN_UID_LABEL: &str = "weblogic.domainUID";
/// Label on server pods naming the server
pub const SERVER_NAME_LABEL: &str = "weblogic.serverName";
/// Label on server pods naming the cluster, absent for non-clustered servers
pub const CLUSTER_NAME_LABEL: &str = "weblogic.clusterName";
/// Label on server pods carrying the restart version they were created with
pub const RESTART_VERSION_LABEL: &str = "weblogic.domainRestartVersion";
/// Label set on every pod created by this operator
pub const CREATED_BY_OPERATOR_LABEL: &str = "weblogic.createdByOperator";

/// Domain is a Custom Resource describing a clustered middleware domain
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "weblogic.oracle",
    version = "v9",
    kind = "Domain",
    namespaced,
    status = "DomainStatus",
    shortname = "dom",
    printcolumn = r#"{"name":"UID", "type":"string", "jsonPath":".spec.domainUID"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"RestartVersion", "type":"string", "jsonPath":".spec.restartVersion"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct DomainSpec {
    /// Unique identifier of the domain; defaults to the resource name
    #[serde(rename = "domainUID", skip_serializing_if = "Option::is_none")]
    pub domain_uid: Option<String>,

    /// Default replica count of clusters that do not set their own
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Changing this value rolls every server pod of the domain
    #[serde(rename = "restartVersion", skip_serializing_if = "Option::is_none")]
    pub restart_version: Option<String>,

    /// Default maximum number of unavailable members per cluster during a roll
    #[serde(
        rename = "maxClusterUnavailable",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_cluster_unavailable: Option<i32>,

    /// Clusters of the domain
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<ClusterSpec>,
}

fn default_replicas() -> i32 {
    1
}

/// Default when neither cluster nor domain sets a max-unavailable value
pub const DEFAULT_MAX_UNAVAILABLE: i32 = 1;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ClusterSpec {
    #[serde(rename = "clusterName")]
    pub cluster_name: String,

    /// Desired number of running members; defaults to the domain replicas
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Maximum number of members that may be unavailable during a roll
    #[serde(rename = "maxUnavailable", skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<i32>,

    /// Configured member servers in topology order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<String>,
}

impl Domain {
    pub fn domain_uid(&self) -> String {
        self.spec
            .domain_uid
            .clone()
            .unwrap_or_else(|| self.name_any())
    }

    pub fn restart_version(&self) -> &str {
        self.spec.restart_version.as_deref().unwrap_or_default()
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterSpec> {
        self.spec.clusters.iter().find(|c| c.cluster_name == name)
    }

    /// Replica count of a cluster, falling back to the domain replicas
    pub fn replica_count(&self, cluster: &str) -> i32 {
        self.cluster(cluster)
            .and_then(|c| c.replicas)
            .unwrap_or(self.spec.replicas)
    }

    pub fn max_unavailable(&self, cluster: &str) -> i32 {
        self.cluster(cluster)
            .and_then(|c| c.max_unavailable)
            .or(self.spec.max_cluster_unavailable)
            .unwrap_or(DEFAULT_MAX_UNAVAILABLE)
    }

    /// Members that must stay Ready during a roll: replicas - maxUnavailable, never negative
    pub fn min_available(&self, cluster: &str) -> usize {
        let min = self.replica_count(cluster) - self.max_unavailable(cluster);
        usize::try_from(min).unwrap_or(0)
    }
}

/// Condition types reported on the domain status
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum DomainConditionType {
    /// Enough servers are Ready
    Available,
    /// A rolling restart is in progress
    Rolling,
    /// A Kubernetes call or a restart failed for good
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct DomainCondition {
    #[serde(rename = "type")]
    pub condition_type: DomainConditionType,

    /// "True" or "False"
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// RFC3339 timestamp of the last status change
    #[serde(
        rename = "lastTransitionTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_transition_time: Option<String>,
}

impl DomainCondition {
    pub fn new(condition_type: DomainConditionType, status: bool) -> Self {
        DomainCondition {
            condition_type,
            status: if status { "True" } else { "False" }.to_string(),
            reason: None,
            message: None,
            last_transition_time: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }
}

/// Observed state of one server
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ServerStatus {
    #[serde(rename = "serverName")]
    pub server_name: String,

    #[serde(rename = "clusterName", skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    /// RUNNING, STARTING or SHUTTING_DOWN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    #[serde(default)]
    pub ready: bool,
}

/// Status of the Domain
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct DomainStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<DomainCondition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<ServerStatus>,

    #[serde(
        rename = "observedGeneration",
        skip_serializing_if = "Option::is_none"
    )]
    pub observed_generation: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DomainStatus {
    pub fn condition(&self, condition_type: DomainConditionType) -> Option<&DomainCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    pub fn has_true_condition(&self, condition_type: DomainConditionType) -> bool {
        self.condition(condition_type).is_some_and(DomainCondition::is_true)
    }

    /// Insert or replace the condition of the same type
    ///
    /// The transition time is kept when the status value does not change.
    pub fn set_condition(&mut self, mut condition: DomainCondition, now: &str) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type)
        {
            Some(existing) => {
                condition.last_transition_time = if existing.status == condition.status {
                    existing.last_transition_time.clone()
                } else {
                    Some(now.to_string())
                };
                *existing = condition;
            }
            None => {
                condition.last_transition_time = Some(now.to_string());
                self.conditions.push(condition);
            }
        }
    }

    pub fn remove_condition(&mut self, condition_type: DomainConditionType) {
        self.conditions.retain(|c| c.condition_type != condition_type);
    }

    /// Record a failure: Failed=True with reason and message mirrored on the status
    pub fn record_failure(&mut self, reason: &str, message: &str, now: &str) {
        self.set_condition(
            DomainCondition::new(DomainConditionType::Failed, true)
                .with_reason(reason)
                .with_message(message),
            now,
        );
        self.reason = Some(reason.to_string());
        self.message = Some(message.to_string());
    }
}

#[cfg(test)]
#[path = "domain_test.rs"]
mod tests;
