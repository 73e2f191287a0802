//! dbop core types: the DbCluster resource, tier descriptors and status aggregation.

#![forbid(unsafe_code)]

use std::cmp::Ordering;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod descriptor;
mod status;

pub use descriptor::{Component, Tier};
pub use status::{
    AppState, AppStatus, ClusterCondition, ClusterConditionType, ConditionStatus, DbClusterStatus,
    DEFAULT_MAX_CONDITIONS,
};

/// Schema version assumed for resources that do not declare `crVersion`.
pub const CURRENT_CR_VERSION: &str = "1.7.0";

/// Desired state of a database cluster: one node tier plus optional proxy tiers.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "dbop.io",
    version = "v1",
    kind = "DbCluster",
    namespaced,
    status = "DbClusterStatus",
    shortname = "dbc",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct DbClusterSpec {
    /// Schema/behavior version marker, dotted numeric (e.g. "1.6.0").
    #[serde(default)]
    pub cr_version: String,
    pub pxc: PodSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub haproxy: Option<PodSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxysql: Option<PodSpec>,
}

/// Per-tier desired configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub size: i32,
    #[serde(default)]
    pub service_type: ServiceType,
}

impl PodSpec {
    pub fn new(size: i32) -> Self {
        Self { enabled: true, size, service_type: ServiceType::default() }
    }

    /// Load-balanced exposure needs an externally provisioned ingress point.
    pub fn is_load_balanced(&self) -> bool {
        self.service_type == ServiceType::LoadBalancer
    }
}

/// Network exposure mode of a tier's service.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ServiceType {
    #[default]
    #[serde(rename = "ClusterIP")]
    ClusterIp,
    NodePort,
    LoadBalancer,
}

impl DbCluster {
    /// Compare the declared schema version with `version`.
    /// An empty `crVersion` counts as [`CURRENT_CR_VERSION`].
    pub fn compare_version_with(&self, version: &str) -> Ordering {
        let declared = if self.spec.cr_version.trim().is_empty() {
            CURRENT_CR_VERSION
        } else {
            self.spec.cr_version.as_str()
        };
        parse_version(declared).cmp(&parse_version(version))
    }

    pub fn version_at_least(&self, version: &str) -> bool {
        self.compare_version_with(version) != Ordering::Less
    }
}

/// Dotted numeric version; missing or unparsable parts are 0.
fn parse_version(v: &str) -> [u64; 3] {
    let v = v.trim().trim_start_matches('v');
    let mut out = [0u64; 3];
    for (slot, part) in out.iter_mut().zip(v.split('.')) {
        *slot = part.parse().unwrap_or(0);
    }
    out
}

pub mod prelude {
    pub use super::{
        AppState, AppStatus, ClusterCondition, ClusterConditionType, Component, ConditionStatus, DbCluster,
        DbClusterSpec, DbClusterStatus, PodSpec, ServiceType, Tier,
    };
}
