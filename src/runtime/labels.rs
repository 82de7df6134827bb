//! Container label keys and label filters
//!
//! Every container managed by capd carries a cluster label and a role label.
//! Node pool machines additionally carry the pool label, and may carry a
//! failure-domain label used as a placement hint.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Label holding the owning cluster name
pub const CLUSTER_LABEL: &str = "io.x-k8s.kind.cluster";

/// Label holding the node role
pub const ROLE_LABEL: &str = "io.x-k8s.kind.role";

/// Label holding the owning machine pool name
pub const MACHINE_POOL_LABEL: &str = "docker.cluster.x-k8s.io/machine-pool";

/// Label holding the failure domain a machine was placed in
pub const FAILURE_DOMAIN_LABEL: &str = "docker.cluster.x-k8s.io/failure-domain";

/// Role of a container inside a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    ControlPlane,
    Worker,
    ExternalLoadBalancer,
}

impl NodeRole {
    /// Value stored under [`ROLE_LABEL`]
    pub fn label_value(&self) -> &'static str {
        match self {
            NodeRole::ControlPlane => "control-plane",
            NodeRole::Worker => "worker",
            NodeRole::ExternalLoadBalancer => "external-load-balancer",
        }
    }

    /// Parse a role label value
    pub fn from_label_value(value: &str) -> Option<Self> {
        match value {
            "control-plane" => Some(NodeRole::ControlPlane),
            "worker" => Some(NodeRole::Worker),
            "external-load-balancer" => Some(NodeRole::ExternalLoadBalancer),
            _ => None,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label_value())
    }
}

/// Exact-match label filter for listing containers
///
/// A container matches when every key in the filter is present on the
/// container with the same value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelFilter {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelFilter {
    /// Create an empty filter (matches everything)
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter on the containers of one cluster
    pub fn for_cluster(cluster_name: &str) -> Self {
        Self::new().with(CLUSTER_LABEL, cluster_name)
    }

    /// Filter on the containers of one cluster with the given role
    pub fn for_role(cluster_name: &str, role: NodeRole) -> Self {
        Self::for_cluster(cluster_name).with(ROLE_LABEL, role.label_value())
    }

    /// Add a key/value requirement
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels.insert(key.into(), value.into());
        self
    }

    /// Check if labels match this filter
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Labels to stamp on a container so that it matches this filter
    pub fn to_labels(&self) -> BTreeMap<String, String> {
        self.match_labels.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.match_labels.iter()
    }
}
