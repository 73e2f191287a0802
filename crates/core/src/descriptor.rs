use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{DbCluster, DbClusterSpec, PodSpec};

/// The fixed set of tiers a cluster is built from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    /// Database nodes; always enabled.
    Node,
    HaProxy,
    ProxySql,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Node, Tier::HaProxy, Tier::ProxySql];

    /// Component name used in labels and object names.
    pub fn name(&self) -> &'static str {
        match self {
            Tier::Node => "pxc",
            Tier::HaProxy => "haproxy",
            Tier::ProxySql => "proxysql",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.name())
    }
}

/// One tier of one cluster: knows how to find its members, its workload and its service.
/// Everything here is a pure function of the cluster name and the tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Component {
    tier: Tier,
    cluster: String,
}

impl Component {
    pub fn new(tier: Tier, cluster: impl Into<String>) -> Self {
        Self { tier, cluster: cluster.into() }
    }

    pub fn node(cr: &DbCluster) -> Self { Self::for_cluster(Tier::Node, cr) }
    pub fn haproxy(cr: &DbCluster) -> Self { Self::for_cluster(Tier::HaProxy, cr) }
    pub fn proxysql(cr: &DbCluster) -> Self { Self::for_cluster(Tier::ProxySql, cr) }

    fn for_cluster(tier: Tier, cr: &DbCluster) -> Self {
        Self::new(tier, cr.metadata.name.clone().unwrap_or_default())
    }

    pub fn tier(&self) -> Tier { self.tier }
    pub fn cluster(&self) -> &str { &self.cluster }

    /// Label set carried by every member process of this tier.
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app.kubernetes.io/name".to_string(), "dbcluster".to_string()),
            ("app.kubernetes.io/instance".to_string(), self.cluster.clone()),
            ("app.kubernetes.io/component".to_string(), self.tier.name().to_string()),
            ("app.kubernetes.io/managed-by".to_string(), "dbop".to_string()),
        ])
    }

    /// Name of the StatefulSet running this tier.
    pub fn workload_name(&self) -> String {
        format!("{}-{}", self.cluster, self.tier.name())
    }

    /// Name of the Service exposing this tier.
    pub fn service_name(&self) -> String {
        format!("{}-{}", self.cluster, self.tier.name())
    }

    /// Desired configuration of this tier, `None` when the tier is switched off.
    /// The node tier is always on.
    pub fn pod_spec<'a>(&self, spec: &'a DbClusterSpec) -> Option<&'a PodSpec> {
        match self.tier {
            Tier::Node => Some(&spec.pxc),
            Tier::HaProxy => spec.haproxy.as_ref().filter(|p| p.enabled),
            Tier::ProxySql => spec.proxysql.as_ref().filter(|p| p.enabled),
        }
    }
}
